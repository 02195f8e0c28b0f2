//! `Threaded`: one OS thread per connection, capped at `max_clients`
//! concurrently in flight. Each connection remains fully isolated from every
//! other even though threads share an address space: no state is shared
//! across the `serve` call boundary except the scoreboard-free counters this
//! engine keeps for itself.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::ProxyError;
use crate::shutdown::ShutdownToken;

use super::{accept_with_shutdown, Engine, ServeConnectionFn};

pub struct ThreadedEngine {
    max_clients: usize,
}

impl ThreadedEngine {
    /// `max_clients == 0` means unbounded.
    pub fn new(max_clients: usize) -> Self {
        Self { max_clients }
    }
}

impl Engine for ThreadedEngine {
    fn run(
        &self,
        listener: TcpListener,
        serve: ServeConnectionFn,
        shutdown: ShutdownToken,
    ) -> Result<(), ProxyError> {
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        loop {
            if self.max_clients > 0 {
                while active.load(Ordering::SeqCst) >= self.max_clients {
                    if shutdown.is_shutting_down() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }

            match accept_with_shutdown(&listener, &shutdown)? {
                None => break,
                Some((stream, addr)) => {
                    debug!(target: "proxy::connect", %addr, "accepted connection");
                    let serve = serve.clone();
                    let shutdown = shutdown.clone();
                    let active = active.clone();
                    active.fetch_add(1, Ordering::SeqCst);
                    handles.push(std::thread::spawn(move || {
                        serve(stream, addr, shutdown);
                        active.fetch_sub(1, Ordering::SeqCst);
                    }));
                }
            }

            handles.retain(|h| !h.is_finished());
        }

        for h in handles {
            let _ = h.join();
        }
        Ok(())
    }
}
