//! Signal-driven shutdown as a cancellation token: `SIGTERM`/`SIGINT` flip a
//! process-wide flag from the (strictly async-signal-safe) handler;
//! everything else just polls the flag at its own suspension points (accept
//! loops, read/write loops, the scoreboard's spawn/reap cycle) instead of
//! being asynchronously interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SigHandler, Signal};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// A cheaply clonable handle to the process-wide shutdown flag. Engines and
/// connection loops check this between units of work rather than being
/// torn down mid-request.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn is_shutting_down(&self) -> bool {
        self.inner.load(Ordering::SeqCst) || SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// For engines (`ForkPerConn`, `Scoreboard`) whose worker processes
    /// don't share memory with the parent: each worker re-reads the signal
    /// flag it inherited at fork time via this same static, so children
    /// observe `SIGTERM` delivered to their own pid without extra wiring.
    pub fn local() -> Self {
        Self { inner: Arc::new(AtomicBool::new(false)) }
    }

    /// Used by tests and by a worker that wants to cancel its own loop
    /// without going through a real signal.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }
}

/// Installs handlers for `SIGTERM` and `SIGINT` that flip the shared flag.
/// Call once, before spawning any worker process or thread, so every
/// engine's `ShutdownToken::is_shutting_down` observes the same signal.
///
/// # Safety note
/// The handler only performs a single relaxed-adjacent atomic store, the
/// one operation signal handlers are always allowed to do safely.
pub fn install_handlers() -> Result<ShutdownToken, nix::Error> {
    let handler = SigHandler::Handler(handle_shutdown_signal);
    unsafe {
        signal::signal(Signal::SIGTERM, handler)?;
        signal::signal(Signal::SIGINT, handler)?;
    }
    Ok(ShutdownToken { inner: Arc::new(AtomicBool::new(false)) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_locally() {
        let token = ShutdownToken::local();
        assert!(!token.is_shutting_down());
        token.cancel();
        assert!(token.is_shutting_down());
    }
}
