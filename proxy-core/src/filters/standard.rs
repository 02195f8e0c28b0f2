//! Component F: the standard RFC 2616 header filter every proxy installs
//! unconditionally at both header stages: `Via`, `X-Forwarded-For`,
//! hop-by-hop extraction, `Max-Forwards` handling for `TRACE`/`OPTIONS`, and
//! stripping of `Client-*`/`Accept-Encoding`.

use http::Method;

use crate::context::ProxyContext;
use crate::headers::Headers;
use crate::message::{HttpVersion, Response};

use super::traits::{HeaderFilter, MessageHead};

/// Header names that are meaningful only between one pair of connected
/// parties and must never be forwarded verbatim to the other leg.
const STATIC_HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "public",
];

fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    STATIC_HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
        || connection_tokens.iter().any(|t| t.eq_ignore_ascii_case(name))
}

fn connection_tokens(headers: &Headers) -> Vec<String> {
    headers
        .get_all("connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

pub struct StandardHeaderFilter {
    via: String,
    x_forwarded_for: bool,
}

impl StandardHeaderFilter {
    pub fn new(via: impl Into<String>, x_forwarded_for: bool) -> Self {
        Self { via: via.into(), x_forwarded_for }
    }

    fn apply_request(&self, headers: &mut Headers, head: &MessageHead, ctx: &mut ProxyContext) {
        let MessageHead::Request { method, version, .. } = head else {
            unreachable!("apply_request only called for the request stage")
        };

        if !self.via.is_empty() {
            headers.append("Via", format!("{} {}", http_version_token(*version), self.via));
        }

        if self.x_forwarded_for {
            let ip = ctx.peer_addr.ip().to_string();
            headers.append("X-Forwarded-For", ip);
        }

        self.extract_hop_by_hop(headers, ctx);

        if let Some(short_circuit) = self.handle_max_forwards(headers, *method, *version) {
            ctx.response = Some(short_circuit);
            return;
        }

        for name in headers
            .names()
            .into_iter()
            .filter(|n| n.len() > 7 && n[..7].eq_ignore_ascii_case("client-"))
            .map(str::to_string)
            .collect::<Vec<_>>()
        {
            headers.remove(&name);
        }
        headers.remove("accept-encoding");
    }

    fn apply_response(&self, headers: &mut Headers, head: &MessageHead, ctx: &mut ProxyContext) {
        let MessageHead::Response { version, .. } = head else {
            unreachable!("apply_response only called for the response stage")
        };

        self.extract_hop_by_hop(headers, ctx);

        for name in headers
            .names()
            .into_iter()
            .filter(|n| n.len() > 7 && n[..7].eq_ignore_ascii_case("client-"))
            .map(str::to_string)
            .collect::<Vec<_>>()
        {
            headers.remove(&name);
        }

        if !headers.contains("Server") {
            headers.set("Server", format!("ProxyCore/{}", env!("CARGO_PKG_VERSION")));
        }
        if !headers.contains("Date") {
            headers.set("Date", httpdate::fmt_http_date(std::time::SystemTime::now()));
        }

        if !self.via.is_empty() {
            headers.append("Via", format!("{} {}", http_version_token(*version), self.via));
        }
    }

    fn extract_hop_by_hop(&self, headers: &mut Headers, ctx: &mut ProxyContext) {
        let tokens = connection_tokens(headers);
        for name in headers
            .names()
            .into_iter()
            .filter(|n| is_hop_by_hop(n, &tokens))
            .map(str::to_string)
            .collect::<Vec<_>>()
        {
            for value in headers.remove(&name) {
                ctx.hop_headers.append(name.clone(), value);
            }
        }
    }

    /// TRACE/OPTIONS with `Max-Forwards: 0` must be answered by this proxy
    /// rather than forwarded, per RFC 2616 §14.31. Returns the synthetic
    /// response when that applies, `None` when the request should proceed
    /// upstream (with `Max-Forwards` decremented in place).
    fn handle_max_forwards(
        &self,
        headers: &mut Headers,
        method: &Method,
        version: HttpVersion,
    ) -> Option<Response> {
        if *method != Method::TRACE && *method != Method::OPTIONS {
            return None;
        }
        let raw = headers.get_first("max-forwards")?;
        let n: u64 = raw.trim().parse().ok()?;

        if n > 0 {
            headers.set("Max-Forwards", (n - 1).to_string());
            return None;
        }

        if *method == Method::TRACE {
            let mut body = format!("{method} * {version}\r\n");
            body.push_str(&headers.to_string());
            Some(
                Response::new(http::StatusCode::OK, version)
                    .with_header("Content-Type", "message/http")
                    .with_body(body),
            )
        } else {
            Some(
                Response::new(http::StatusCode::OK, version)
                    .with_header("Allow", "GET, HEAD, POST, PUT, DELETE, OPTIONS, TRACE, CONNECT")
                    .with_header("Content-Length", "0"),
            )
        }
    }
}

fn http_version_token(version: HttpVersion) -> &'static str {
    match version {
        HttpVersion::Http10 => "1.0",
        HttpVersion::Http11 => "1.1",
    }
}

impl HeaderFilter for StandardHeaderFilter {
    fn filter(&self, headers: &mut Headers, head: &MessageHead, ctx: &mut ProxyContext) {
        match head {
            MessageHead::Request { .. } => self.apply_request(headers, head, ctx),
            MessageHead::Response { .. } => self.apply_response(headers, head, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    fn ctx() -> ProxyContext {
        ProxyContext::new("10.0.0.7:4000".parse().unwrap())
    }

    #[test]
    fn appends_via_and_x_forwarded_for_on_request() {
        let filter = StandardHeaderFilter::new("proxy.local (ProxyCore/0.5.0)", true);
        let mut headers = Headers::new();
        let method = Method::GET;
        let uri: Uri = "http://example.com/".parse().unwrap();
        let head = MessageHead::Request { method: &method, uri: &uri, version: HttpVersion::Http11 };
        let mut c = ctx();
        filter.filter(&mut headers, &head, &mut c);

        assert_eq!(headers.get_first("via"), Some("1.1 proxy.local (ProxyCore/0.5.0)"));
        assert_eq!(headers.get_first("x-forwarded-for"), Some("10.0.0.7"));
    }

    #[test]
    fn empty_via_disables_via_header() {
        let filter = StandardHeaderFilter::new("", true);
        let mut headers = Headers::new();
        let method = Method::GET;
        let uri: Uri = "http://example.com/".parse().unwrap();
        let head = MessageHead::Request { method: &method, uri: &uri, version: HttpVersion::Http11 };
        let mut c = ctx();
        filter.filter(&mut headers, &head, &mut c);

        assert!(!headers.contains("Via"));
        assert_eq!(headers.get_first("x-forwarded-for"), Some("10.0.0.7"));
    }

    #[test]
    fn strips_client_star_and_accept_encoding() {
        let filter = StandardHeaderFilter::new("proxy.local", false);
        let mut headers = Headers::new();
        headers.append("Client-IP", "1.2.3.4");
        headers.append("Accept-Encoding", "gzip");
        let method = Method::GET;
        let uri: Uri = "http://example.com/".parse().unwrap();
        let head = MessageHead::Request { method: &method, uri: &uri, version: HttpVersion::Http11 };
        let mut c = ctx();
        filter.filter(&mut headers, &head, &mut c);

        assert!(!headers.contains("Client-IP"));
        assert!(!headers.contains("Accept-Encoding"));
    }

    #[test]
    fn hop_by_hop_headers_move_to_ctx() {
        let filter = StandardHeaderFilter::new("proxy.local", false);
        let mut headers = Headers::new();
        headers.append("Connection", "keep-alive, X-Custom-Hop");
        headers.append("X-Custom-Hop", "1");
        headers.append("Keep-Alive", "timeout=5");
        let method = Method::GET;
        let uri: Uri = "http://example.com/".parse().unwrap();
        let head = MessageHead::Request { method: &method, uri: &uri, version: HttpVersion::Http11 };
        let mut c = ctx();
        filter.filter(&mut headers, &head, &mut c);

        assert!(!headers.contains("Connection"));
        assert!(!headers.contains("Keep-Alive"));
        assert!(!headers.contains("X-Custom-Hop"));
        assert_eq!(c.hop_headers.get_first("keep-alive"), Some("timeout=5"));
    }

    #[test]
    fn max_forwards_zero_on_trace_short_circuits() {
        let filter = StandardHeaderFilter::new("proxy.local", false);
        let mut headers = Headers::new();
        headers.append("Max-Forwards", "0");
        headers.append("X-Probe", "abc");
        let method = Method::TRACE;
        let uri: Uri = "http://example.com/".parse().unwrap();
        let head = MessageHead::Request { method: &method, uri: &uri, version: HttpVersion::Http11 };
        let mut c = ctx();
        filter.filter(&mut headers, &head, &mut c);

        let resp = c.response.expect("TRACE with Max-Forwards: 0 must short-circuit");
        assert_eq!(resp.status, http::StatusCode::OK);
        assert!(String::from_utf8_lossy(&resp.body).contains("X-Probe: abc"));
    }

    #[test]
    fn max_forwards_positive_is_decremented_and_forwarded() {
        let filter = StandardHeaderFilter::new("proxy.local", false);
        let mut headers = Headers::new();
        headers.append("Max-Forwards", "3");
        let method = Method::OPTIONS;
        let uri: Uri = "http://example.com/".parse().unwrap();
        let head = MessageHead::Request { method: &method, uri: &uri, version: HttpVersion::Http11 };
        let mut c = ctx();
        filter.filter(&mut headers, &head, &mut c);

        assert!(c.response.is_none());
        assert_eq!(headers.get_first("max-forwards"), Some("2"));
    }
}
