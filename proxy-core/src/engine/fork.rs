//! `ForkPerConn`: one real OS process per connection. The strongest
//! isolation this crate offers: a crashing connection can't corrupt any
//! other connection's state because they don't share an address space at
//! all, not even by convention.

use std::net::TcpListener;
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::shutdown::ShutdownToken;

use super::{accept_with_shutdown, Engine, ServeConnectionFn};

pub struct ForkPerConnEngine {
    max_clients: usize,
}

impl ForkPerConnEngine {
    /// `max_clients == 0` means unbounded (parent forks without limit).
    pub fn new(max_clients: usize) -> Self {
        Self { max_clients }
    }
}

/// Reaps every child that has already exited, without blocking. Returns
/// how many were reaped.
fn reap_finished(children: &mut Vec<Pid>) -> usize {
    let mut reaped = 0;
    children.retain(|&pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(nix::sys::wait::WaitStatus::StillAlive) => true,
        Ok(_) => {
            reaped += 1;
            false
        }
        Err(nix::errno::Errno::ECHILD) => false,
        Err(_) => true,
    });
    reaped
}

impl Engine for ForkPerConnEngine {
    fn run(
        &self,
        listener: TcpListener,
        serve: ServeConnectionFn,
        shutdown: ShutdownToken,
    ) -> Result<(), ProxyError> {
        let mut children: Vec<Pid> = Vec::new();

        loop {
            reap_finished(&mut children);

            if self.max_clients > 0 {
                while children.len() >= self.max_clients {
                    if shutdown.is_shutting_down() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                    reap_finished(&mut children);
                }
            }

            let accepted = accept_with_shutdown(&listener, &shutdown)
                .map_err(|e| ProxyError::Engine(e.to_string()))?;
            let Some((stream, addr)) = accepted else {
                break;
            };

            debug!(target: "proxy::connect", %addr, "accepted connection, forking worker");

            // SAFETY: between fork() and exec/exit in the child we only
            // touch plain data (the accepted socket, the shutdown flag) and
            // never allocate through a lock another thread might be
            // holding: there is exactly one thread here.
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child, .. }) => {
                    children.push(child);
                    drop(stream);
                }
                Ok(ForkResult::Child) => {
                    drop(listener);
                    serve(stream, addr, ShutdownToken::local());
                    std::process::exit(0);
                }
                Err(errno) => {
                    warn!(target: "proxy::process", %errno, "fork failed, dropping connection");
                    drop(stream);
                }
            }
        }

        while !children.is_empty() {
            reap_finished(&mut children);
            if !children.is_empty() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        Ok(())
    }
}
