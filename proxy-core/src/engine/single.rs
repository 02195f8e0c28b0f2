//! `SingleProcess`: one worker, one connection at a time. The simplest
//! strategy, mainly useful for tests and deterministic reproduction.

use std::net::TcpListener;

use tracing::debug;

use crate::error::ProxyError;
use crate::shutdown::ShutdownToken;

use super::{accept_with_shutdown, Engine, ServeConnectionFn};

#[derive(Debug, Default)]
pub struct SingleProcessEngine;

impl Engine for SingleProcessEngine {
    fn run(
        &self,
        listener: TcpListener,
        serve: ServeConnectionFn,
        shutdown: ShutdownToken,
    ) -> Result<(), ProxyError> {
        loop {
            match accept_with_shutdown(&listener, &shutdown)? {
                None => return Ok(()),
                Some((stream, addr)) => {
                    debug!(target: "proxy::connect", %addr, "accepted connection");
                    serve(stream, addr, shutdown.clone());
                }
            }
        }
    }
}
