//! Component G: the four concurrency strategies a `Proxy` can run under.
//! Every strategy implements the same `Engine` trait over a pre-bound
//! listener, so swapping `engine = "..."` in config never touches
//! `connection.rs`'s per-connection state machine.

pub mod fork;
pub mod scoreboard;
pub mod single;
pub mod threaded;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use crate::error::ProxyError;
use crate::shutdown::ShutdownToken;

pub use fork::ForkPerConnEngine;
pub use scoreboard::ScoreboardEngine;
pub use single::SingleProcessEngine;
pub use threaded::ThreadedEngine;

/// Serves exactly one accepted connection to completion (including any
/// keep-alive requests on it) and returns. Shared across all four engines;
/// `Proxy` builds this once from its config and filter stacks.
pub type ServeConnectionFn = Arc<dyn Fn(TcpStream, SocketAddr, ShutdownToken) + Send + Sync>;

/// A concurrency strategy for turning accepted connections into served
/// requests. `run` blocks until `shutdown` is observed and every
/// in-flight connection this engine is tracking has drained.
pub trait Engine {
    fn run(
        &self,
        listener: TcpListener,
        serve: ServeConnectionFn,
        shutdown: ShutdownToken,
    ) -> Result<(), ProxyError>;
}

/// Polls `listener.accept()` without blocking forever, so every engine can
/// check `shutdown` between attempts instead of being stuck inside a
/// blocking `accept()` call past the point a signal arrived.
pub(crate) fn accept_with_shutdown(
    listener: &TcpListener,
    shutdown: &ShutdownToken,
) -> Result<Option<(TcpStream, SocketAddr)>, std::io::Error> {
    listener.set_nonblocking(true)?;
    loop {
        if shutdown.is_shutting_down() {
            return Ok(None);
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                return Ok(Some((stream, addr)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }
}
