//! Library surface for the intercepting HTTP/1.x forward proxy. The
//! `proxyd` binary (`main.rs`) is a thin wrapper around `Proxy`; embedders
//! link this crate directly to register their own filters.

pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod filters;
pub mod framing;
pub mod headers;
pub mod logging;
pub mod message;
pub mod proxy;
pub mod shutdown;
pub mod upstream;

pub use connection::{ConnectionHandler, FilterStacks};
pub use context::ProxyContext;
pub use error::ProxyError;
pub use headers::Headers;
pub use message::{HttpVersion, Request, Response};
pub use proxy::Proxy;
pub use shutdown::ShutdownToken;
