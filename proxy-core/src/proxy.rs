//! Component J: the control surface. Owns configuration, the four filter
//! stacks, engine selection, and process lifecycle (bind, install signal
//! handlers, run to completion).

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proxy_config::{EngineKind, ProxyConfig};

use crate::connection::{ConnectionHandler, FilterStacks};
use crate::error::ProxyError;
use crate::engine::{
    Engine, ForkPerConnEngine, ScoreboardEngine, ServeConnectionFn, SingleProcessEngine,
    ThreadedEngine,
};
use crate::filters::standard::StandardHeaderFilter;
use crate::filters::predicate::MatchPredicate;
use crate::filters::{BodyFilter, HeaderFilter};
use crate::shutdown::{self, ShutdownToken};

/// Owns the config and filter stacks for one proxy instance. Built once,
/// extended with user filters (`push_request_header_filter` and friends),
/// then handed to `run()` which consumes it.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    filters: FilterStacks,
}

impl Proxy {
    /// Builds a `Proxy` with only the standard RFC 2616 header filter
    /// installed at both header stages, registered implicitly before any
    /// user-supplied filters.
    pub fn new(config: ProxyConfig) -> Self {
        let mut filters = FilterStacks::new();
        let always = MatchPredicate::always();
        filters.req_headers.push(
            always.clone(),
            Box::new(StandardHeaderFilter::new(config.via.clone(), config.x_forwarded_for)),
        );
        filters.resp_headers.push(
            always,
            Box::new(StandardHeaderFilter::new(config.via.clone(), config.x_forwarded_for)),
        );
        Self { config: Arc::new(config), filters }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn push_request_header_filter(&mut self, predicate: MatchPredicate, filter: Box<dyn HeaderFilter>) {
        self.filters.req_headers.push(predicate, filter);
    }

    pub fn push_request_body_filter(&mut self, predicate: MatchPredicate, filter: Box<dyn BodyFilter>) {
        self.filters.req_body.push(predicate, filter);
    }

    pub fn push_response_header_filter(&mut self, predicate: MatchPredicate, filter: Box<dyn HeaderFilter>) {
        self.filters.resp_headers.push(predicate, filter);
    }

    pub fn push_response_body_filter(&mut self, predicate: MatchPredicate, filter: Box<dyn BodyFilter>) {
        self.filters.resp_body.push(predicate, filter);
    }

    /// Binds the listener, installs `SIGTERM`/`SIGINT` handlers, and runs
    /// the configured engine until shutdown or `max_connections` is reached
    /// (0 means unbounded).
    pub fn run(self) -> Result<(), ProxyError> {
        let shutdown = shutdown::install_handlers().map_err(|e| ProxyError::Engine(e.to_string()))?;
        self.run_with_shutdown(shutdown)
    }

    /// As `run`, but with caller-supplied shutdown wiring, used by tests
    /// that need to cancel a running proxy without sending a real signal.
    pub fn run_with_shutdown(self, shutdown: ShutdownToken) -> Result<(), ProxyError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .map_err(|e| ProxyError::Engine(format!("bind {}:{} failed: {e}", self.config.host, self.config.port)))?;
        self.run_on_listener(listener, shutdown)
    }

    /// Runs against an already-bound listener. Lets integration tests bind
    /// to an ephemeral port (`:0`), read back the assigned address, and
    /// only then hand the listener to the proxy.
    pub fn run_on_listener(self, listener: TcpListener, shutdown: ShutdownToken) -> Result<(), ProxyError> {
        let handler = Arc::new(ConnectionHandler::new(Arc::new(self.filters), self.config.clone()));
        let served = Arc::new(AtomicUsize::new(0));
        let max_connections = self.config.max_connections;
        let counting_shutdown = shutdown.clone();

        let serve: ServeConnectionFn = Arc::new(move |stream, addr, token| {
            handler.serve(stream, addr, token);
            if max_connections > 0 {
                let count = served.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= max_connections {
                    counting_shutdown.cancel();
                }
            }
        });

        let engine: Box<dyn Engine> = match self.config.engine {
            EngineKind::SingleProcess => Box::new(SingleProcessEngine),
            EngineKind::ForkPerConn => Box::new(ForkPerConnEngine::new(self.config.max_clients)),
            EngineKind::Scoreboard => {
                Box::new(ScoreboardEngine::new(self.config.scoreboard, self.config.max_clients))
            }
            EngineKind::Threaded => Box::new(ThreadedEngine::new(self.config.max_clients)),
        };

        engine.run(listener, serve, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_installs_standard_filter_at_both_header_stages() {
        let proxy = Proxy::new(ProxyConfig::default());
        assert_eq!(proxy.filters.req_headers.len(), 1);
        assert_eq!(proxy.filters.resp_headers.len(), 1);
        assert!(proxy.filters.req_body.is_empty());
        assert!(proxy.filters.resp_body.is_empty());
    }
}
