//! `Scoreboard`: an Apache-style pre-fork pool. A fixed-ish number of
//! worker processes are forked up front, each serializing its own
//! `accept()` calls against the others via an advisory file lock; workers
//! report their status to the parent over a pipe using a fixed 5-byte
//! `(pid: u32, status: u8)` record, kept stable and testable on its own.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, pipe, ForkResult, Pid};
use proxy_config::ScoreboardConfig;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::shutdown::ShutdownToken;

use super::{Engine, ServeConnectionFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Idle = 0,
    Busy = 1,
    Exiting = 2,
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized worker status byte {0}")]
pub struct UnknownWorkerStatus(u8);

impl TryFrom<u8> for WorkerStatus {
    type Error = UnknownWorkerStatus;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(WorkerStatus::Idle),
            1 => Ok(WorkerStatus::Busy),
            2 => Ok(WorkerStatus::Exiting),
            other => Err(UnknownWorkerStatus(other)),
        }
    }
}

/// The `(pid, status)` record a worker writes to the shared pipe each time
/// its status changes. Fixed-width and little-endian so the wire contract
/// is exercised directly by `encode`/`decode`, independent of whether any
/// process was actually forked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreboardRecord {
    pub pid: u32,
    pub status: WorkerStatus,
}

impl ScoreboardRecord {
    pub const WIRE_LEN: usize = 5;

    pub fn encode(self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4] = self.status as u8;
        buf
    }

    pub fn decode(buf: [u8; Self::WIRE_LEN]) -> Result<Self, UnknownWorkerStatus> {
        let pid = u32::from_le_bytes(buf[..4].try_into().expect("4-byte slice"));
        let status = WorkerStatus::try_from(buf[4])?;
        Ok(Self { pid, status })
    }
}

pub struct ScoreboardEngine {
    config: ScoreboardConfig,
    max_clients: usize,
}

impl ScoreboardEngine {
    pub fn new(config: ScoreboardConfig, max_clients: usize) -> Self {
        Self { config, max_clients }
    }
}

struct WorkerLoop {
    listener: TcpListener,
    lock_file: File,
    status_pipe_write: OwnedFd,
    serve: ServeConnectionFn,
    shutdown: ShutdownToken,
    max_requests: u32,
}

impl WorkerLoop {
    fn report(&mut self, status: WorkerStatus) {
        let record = ScoreboardRecord { pid: std::process::id(), status };
        let bytes = record.encode();
        let _ = nix::unistd::write(&self.status_pipe_write, &bytes);
    }

    fn run(mut self) -> ! {
        let mut served = 0u32;
        loop {
            if self.shutdown.is_shutting_down() {
                break;
            }

            self.report(WorkerStatus::Idle);

            let lock_fd = match self.lock_file.try_clone() {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(target: "proxy::process", error = %e, "worker failed to dup accept lock fd");
                    continue;
                }
            };
            let guard = match Flock::lock(lock_fd, FlockArg::LockExclusive) {
                Ok(guard) => guard,
                Err((_, errno)) => {
                    warn!(target: "proxy::process", %errno, "worker failed to acquire accept lock");
                    continue;
                }
            };
            let accepted = self.listener.accept();
            drop(guard);

            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(target: "proxy::connect", error = %e, "worker accept failed");
                    continue;
                }
            };

            self.report(WorkerStatus::Busy);
            (self.serve)(stream, addr, self.shutdown.clone());
            served += 1;

            if self.max_requests > 0 && served >= self.max_requests {
                break;
            }
        }

        self.report(WorkerStatus::Exiting);
        std::process::exit(0);
    }
}

impl Engine for ScoreboardEngine {
    fn run(
        &self,
        listener: TcpListener,
        serve: ServeConnectionFn,
        shutdown: ShutdownToken,
    ) -> Result<(), ProxyError> {
        let lock_file = anonymous_lock_file().map_err(|e| ProxyError::Engine(e.to_string()))?;
        let (read_fd, write_fd) = pipe().map_err(|e| ProxyError::Engine(e.to_string()))?;

        let mut scoreboard: HashMap<u32, WorkerStatus> = HashMap::new();
        let mut last_fork = Instant::now() - Duration::from_secs(60);
        const MIN_FORK_INTERVAL: Duration = Duration::from_millis(100);

        let spawn_worker = |scoreboard: &mut HashMap<u32, WorkerStatus>,
                             listener: &TcpListener,
                             lock_file: &File,
                             write_fd: &OwnedFd|
         -> Result<(), ProxyError> {
            let listener = listener.try_clone().map_err(|e| ProxyError::Engine(e.to_string()))?;
            let lock_file = lock_file.try_clone().map_err(|e| ProxyError::Engine(e.to_string()))?;
            let write_fd = write_fd.try_clone().map_err(|e| ProxyError::Engine(e.to_string()))?;
            let serve = serve.clone();
            let worker_shutdown = ShutdownToken::local();
            let max_requests = self.config.max_requests_per_child as u32;

            match unsafe { fork() }.map_err(|e| ProxyError::Engine(e.to_string()))? {
                ForkResult::Parent { child, .. } => {
                    scoreboard.insert(child.as_raw() as u32, WorkerStatus::Idle);
                    Ok(())
                }
                ForkResult::Child => {
                    let worker = WorkerLoop {
                        listener,
                        lock_file,
                        status_pipe_write: write_fd,
                        serve,
                        shutdown: worker_shutdown,
                        max_requests,
                    };
                    worker.run();
                }
            }
        };

        for _ in 0..self.config.start_servers {
            spawn_worker(&mut scoreboard, &listener, &lock_file, &write_fd)?;
            last_fork = Instant::now();
        }

        let mut pipe_reader: File = read_fd.into();
        set_nonblocking(&pipe_reader)?;

        loop {
            if shutdown.is_shutting_down() {
                break;
            }

            drain_status_updates(&mut pipe_reader, &mut scoreboard);
            reap_dead(&mut scoreboard);

            let idle = scoreboard.values().filter(|s| **s == WorkerStatus::Idle).count();
            let total = scoreboard.len();

            if idle < self.config.min_spare_servers
                && (self.max_clients == 0 || total < self.max_clients)
                && last_fork.elapsed() >= MIN_FORK_INTERVAL
            {
                spawn_worker(&mut scoreboard, &listener, &lock_file, &write_fd)?;
                last_fork = Instant::now();
            } else if idle > self.config.max_spare_servers {
                if let Some((&pid, _)) = scoreboard.iter().find(|(_, s)| **s == WorkerStatus::Idle) {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }

            std::thread::sleep(Duration::from_millis(
                self.config.verify_delay_secs.max(1) * 10,
            ));
        }

        info!(target: "proxy::process", workers = scoreboard.len(), "scoreboard shutting down, signalling workers");
        for &pid in scoreboard.keys() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        while !scoreboard.is_empty() {
            drain_status_updates(&mut pipe_reader, &mut scoreboard);
            reap_dead(&mut scoreboard);
            if !scoreboard.is_empty() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        Ok(())
    }
}

/// Opens and immediately unlinks a regular file whose sole purpose is to be
/// the target of `flock()` calls serializing `accept()` across workers;
/// its contents are never read or written. Unlinking right away means the
/// inode is reclaimed as soon as the last worker closes its fd, with no
/// leftover path for a restart to trip over.
fn anonymous_lock_file() -> Result<File, std::io::Error> {
    let path = std::env::temp_dir().join(format!("proxy-scoreboard-{}.lock", std::process::id()));
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    let _ = std::fs::remove_file(&path);
    Ok(file)
}

fn set_nonblocking(file: &File) -> Result<(), ProxyError> {
    let fd = file.as_raw_fd();
    let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFL).map_err(|e| ProxyError::Engine(e.to_string()))?;
    let mut flags = nix::fcntl::OFlag::from_bits_truncate(flags);
    flags.insert(nix::fcntl::OFlag::O_NONBLOCK);
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(flags)).map_err(|e| ProxyError::Engine(e.to_string()))?;
    Ok(())
}

fn drain_status_updates(pipe_reader: &mut File, scoreboard: &mut HashMap<u32, WorkerStatus>) {
    let mut buf = [0u8; ScoreboardRecord::WIRE_LEN];
    loop {
        match pipe_reader.read_exact(&mut buf) {
            Ok(()) => {
                if let Ok(record) = ScoreboardRecord::decode(buf) {
                    scoreboard.insert(record.pid, record.status);
                }
            }
            Err(_) => break,
        }
    }
}

fn reap_dead(scoreboard: &mut HashMap<u32, WorkerStatus>) {
    scoreboard.retain(|&pid, status| {
        if *status == WorkerStatus::Exiting {
            return false;
        }
        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) => true,
            Ok(_) => false,
            Err(_) => true,
        }
    });
}
