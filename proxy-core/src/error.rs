//! The proxy's error taxonomy, plus the mapping from each kind to the wire
//! response it produces.

use http::StatusCode;

use crate::message::{HttpVersion, Response};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Malformed request line/headers. Reply 400, close after reply.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Forbidden method. Reply 501, close after reply.
    #[error("method {0} is not supported by this proxy")]
    UnsupportedMethod(http::Method),

    /// Unsupported scheme. Reply 501, close after reply.
    #[error("scheme {0} is not supported by this proxy")]
    UnsupportedScheme(String),

    /// Connection refused, DNS failure, read timeout, reset. Synthesizes a
    /// 5xx with an `X-Died` audit header.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A filter panicked or returned an error. Response is replaced with
    /// 500 "Proxy filter error".
    #[error("filter error: {0}")]
    Filter(String),

    /// Fork/thread spawn failure. Logged; the accepted connection is
    /// closed; concurrency cap decremented if warranted.
    #[error("engine error: {0}")]
    Engine(String),

    /// A shutdown signal was delivered.
    #[error("shutdown requested")]
    ShutdownRequested,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Renders the synthetic response this error produces on the wire.
    /// `Io` has no direct wire mapping: callers that can still write to the
    /// socket should treat it like `Upstream`; callers that can't (the
    /// socket itself failed) just close.
    pub fn to_response(&self, version: HttpVersion) -> Response {
        match self {
            ProxyError::MalformedRequest(msg) => {
                Response::new(StatusCode::BAD_REQUEST, version)
                    .with_header("Content-Type", "text/plain; charset=utf-8")
                    .with_body(format!("Bad Request: {msg}"))
            }
            ProxyError::UnsupportedMethod(method) => {
                Response::new(StatusCode::NOT_IMPLEMENTED, version)
                    .with_header("Content-Type", "text/plain; charset=utf-8")
                    .with_body(format!("Method {method} is not supported by this proxy."))
            }
            ProxyError::UnsupportedScheme(scheme) => {
                Response::new(StatusCode::NOT_IMPLEMENTED, version)
                    .with_header("Content-Type", "text/plain; charset=utf-8")
                    .with_body(format!("Scheme {scheme} is not supported by this proxy."))
            }
            ProxyError::Upstream(reason) => {
                Response::new(StatusCode::INTERNAL_SERVER_ERROR, version)
                    .with_header("Content-Type", "text/plain; charset=utf-8")
                    .with_header("X-Died", reason.clone())
                    .with_body(reason.clone())
            }
            ProxyError::Filter(reason) => {
                Response::new(StatusCode::INTERNAL_SERVER_ERROR, version)
                    .with_header("Content-Type", "text/plain; charset=utf-8")
                    .with_body(format!("Proxy filter error: {reason}"))
            }
            ProxyError::Engine(reason) => {
                Response::new(StatusCode::INTERNAL_SERVER_ERROR, version)
                    .with_header("Content-Type", "text/plain; charset=utf-8")
                    .with_body(format!("Proxy engine error: {reason}"))
            }
            ProxyError::ShutdownRequested | ProxyError::Io(_) => {
                Response::new(StatusCode::SERVICE_UNAVAILABLE, version)
                    .with_header("Content-Type", "text/plain; charset=utf-8")
                    .with_body("Proxy is shutting down")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_method_maps_to_501_with_named_method() {
        let err = ProxyError::UnsupportedMethod(http::Method::PATCH);
        let resp = err.to_response(HttpVersion::Http11);
        assert_eq!(resp.status, StatusCode::NOT_IMPLEMENTED);
        assert!(String::from_utf8_lossy(&resp.body).contains("PATCH"));
    }

    #[test]
    fn upstream_error_carries_x_died() {
        let err = ProxyError::Upstream("connection refused".into());
        let resp = err.to_response(HttpVersion::Http11);
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers.get_first("X-Died"), Some("connection refused"));
    }

    #[test]
    fn filter_error_body_mentions_proxy_filter_error() {
        let err = ProxyError::Filter("boom".into());
        let resp = err.to_response(HttpVersion::Http11);
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8_lossy(&resp.body).starts_with("Proxy filter error"));
    }
}
