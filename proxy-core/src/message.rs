//! Component C: the Request/Response message model, plus the HTTP/1.x
//! version restricted to the two tokens this proxy actually speaks.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use http::{Method, StatusCode, Uri};

use crate::headers::Headers;

/// HTTP/1.0 or HTTP/1.1. This proxy never speaks HTTP/2 or HTTP/3, so unlike
/// the request/response body this is a closed, two-value type rather than a
/// reuse of `http::Version`'s broader surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }

    /// Pre-HTTP/1.0 clients don't exist on the wire we parse (we only ever
    /// construct `Http10`/`Http11` from a parsed request line), so this is
    /// really "is this the older of our two supported versions".
    pub fn is_at_least_1_1(self) -> bool {
        self >= HttpVersion::Http11
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported HTTP version token '{0}'")]
pub struct ParseHttpVersionError(String);

impl FromStr for HttpVersion {
    type Err = ParseHttpVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HTTP/1.0" => Ok(HttpVersion::Http10),
            "HTTP/1.1" => Ok(HttpVersion::Http11),
            other => Err(ParseHttpVersionError(other.to_string())),
        }
    }
}

/// A request, mutable until it is dispatched to upstream.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: HttpVersion,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri, version: HttpVersion) -> Self {
        Self {
            method,
            uri,
            version,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

/// A response, mutable until its headers are flushed to the client; after
/// that only body bytes may be transformed.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: HttpVersion,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, version: HttpVersion) -> Self {
        Self {
            status,
            reason: None,
            version,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason().unwrap_or(""))
    }
}

/// Normalizes a request-line URI to absolute form: when the URI arrives in
/// origin-form (just `/path`), the
/// `Host` header supplies the authority, and the scheme defaults to
/// `http` (this proxy never terminates TLS on a forwarded request).
pub fn normalize_request_uri(uri: Uri, headers: &Headers) -> Result<Uri, http::Error> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri);
    }

    let authority = headers
        .get_first("host")
        .unwrap_or("")
        .to_string();

    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();

    Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}
