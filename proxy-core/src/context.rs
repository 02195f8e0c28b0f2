//! Per-connection `ProxyContext`: everything a filter can read or write for
//! the message currently in flight, passed by reference through the
//! connection loop rather than stashed in process-global slots.

use std::net::SocketAddr;

use crate::headers::Headers;
use crate::message::{Request, Response};

pub struct ProxyContext {
    pub request: Option<Request>,
    pub response: Option<Response>,
    pub peer_addr: SocketAddr,
    pub hop_headers: Headers,
    pub served_requests: usize,
}

impl ProxyContext {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            request: None,
            response: None,
            peer_addr,
            hop_headers: Headers::new(),
            served_requests: 0,
        }
    }

    /// True once a request filter has short-circuited the request by
    /// setting a synthetic response.
    pub fn is_short_circuited(&self) -> bool {
        self.response.is_some()
    }

    /// Clears per-message state ahead of the next request on this
    /// connection, keeping the served-request counter and peer address.
    pub fn begin_next_request(&mut self) {
        self.request = None;
        self.response = None;
        self.hop_headers = Headers::new();
    }
}
