//! `MatchPredicate`: the conjunctive set of conditions a `FilterEntry` is
//! gated on. Construction is fallible and is meant to be done once, at
//! registration time, not on every request.

use http::Method;
use regex::Regex;

use crate::message::{Request, Response};

/// Schemes this proxy's upstream client actually knows how to dial.
/// `https` is intentionally absent: this proxy never terminates TLS on a
/// forwarded request, so encrypted traffic only ever reaches it via
/// `CONNECT` tunneling, which bypasses the filter pipeline entirely and
/// never needs a predicate match.
pub const SUPPORTED_SCHEMES: &[&str] = &["http"];

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("invalid mime glob '{0}'")]
    InvalidMime(String),
    #[error("unknown method '{0}' in method list")]
    UnknownMethod(String),
    #[error("scheme '{0}' is not supported by this proxy's upstream client")]
    UnsupportedScheme(String),
    #[error("invalid regex in predicate field '{field}': {source}")]
    BadRegex {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// A single `type/subtype` glob with at most one `*` wildcard per segment.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MimeGlob {
    ty: String,
    subtype: String,
}

impl MimeGlob {
    fn parse(pattern: &str) -> Result<Self, PredicateError> {
        let (ty, subtype) = pattern
            .split_once('/')
            .ok_or_else(|| PredicateError::InvalidMime(pattern.to_string()))?;
        if ty.is_empty() || subtype.is_empty() {
            return Err(PredicateError::InvalidMime(pattern.to_string()));
        }
        Ok(Self { ty: ty.to_string(), subtype: subtype.to_string() })
    }

    fn matches(&self, content_type: &str) -> bool {
        let main = content_type.split(';').next().unwrap_or("").trim();
        let Some((ty, subtype)) = main.split_once('/') else {
            return false;
        };
        segment_matches(&self.ty, ty) && segment_matches(&self.subtype, subtype)
    }
}

fn segment_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern.eq_ignore_ascii_case(value)
}

#[derive(Debug, Clone)]
pub struct MatchPredicate {
    mime: Option<MimeGlob>,
    mime_requires_absent: bool,
    methods: Vec<Method>,
    schemes: Vec<String>,
    host: Regex,
    path: Regex,
    query: Regex,
}

/// Builder for `MatchPredicate`; every field is optional and falls back to
/// its documented default.
#[derive(Debug, Default)]
pub struct MatchPredicateBuilder {
    mime: Option<Option<String>>,
    method: Option<String>,
    scheme: Option<String>,
    host: Option<String>,
    path: Option<String>,
    query: Option<String>,
}

impl MatchPredicateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(glob)` for a normal glob match (`""` means "Content-Type
    /// absent"), `None` for "matches any Content-Type or its absence".
    pub fn mime(mut self, mime: Option<impl Into<String>>) -> Self {
        self.mime = Some(mime.map(|m| m.into()));
        self
    }

    pub fn method(mut self, methods: impl Into<String>) -> Self {
        self.method = Some(methods.into());
        self
    }

    pub fn scheme(mut self, schemes: impl Into<String>) -> Self {
        self.scheme = Some(schemes.into());
        self
    }

    pub fn host(mut self, pattern: impl Into<String>) -> Self {
        self.host = Some(pattern.into());
        self
    }

    pub fn path(mut self, pattern: impl Into<String>) -> Self {
        self.path = Some(pattern.into());
        self
    }

    pub fn query(mut self, pattern: impl Into<String>) -> Self {
        self.query = Some(pattern.into());
        self
    }

    pub fn build(self) -> Result<MatchPredicate, PredicateError> {
        let (mime, mime_requires_absent) = match self.mime.unwrap_or(Some("text/*".to_string())) {
            None => (None, false),
            Some(ref s) if s.is_empty() => (None, true),
            Some(s) => (Some(MimeGlob::parse(&s)?), false),
        };

        let methods = parse_methods(&self.method.unwrap_or_else(|| "GET, POST, HEAD".to_string()))?;
        let schemes = parse_schemes(&self.scheme.unwrap_or_else(|| "http".to_string()))?;

        let host = compile_regex("host", &self.host.unwrap_or_else(|| ".*".to_string()))?;
        let path = compile_regex("path", &self.path.unwrap_or_else(|| ".*".to_string()))?;
        let query = compile_regex("query", &self.query.unwrap_or_else(|| ".*".to_string()))?;

        Ok(MatchPredicate {
            mime,
            mime_requires_absent,
            methods,
            schemes,
            host,
            path,
            query,
        })
    }
}

fn parse_methods(raw: &str) -> Result<Vec<Method>, PredicateError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|tok| {
            Method::from_bytes(tok.as_bytes())
                .map_err(|_| PredicateError::UnknownMethod(tok.to_string()))
        })
        .collect()
}

fn parse_schemes(raw: &str) -> Result<Vec<String>, PredicateError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|tok| {
            let lower = tok.to_ascii_lowercase();
            if SUPPORTED_SCHEMES.contains(&lower.as_str()) {
                Ok(lower)
            } else {
                Err(PredicateError::UnsupportedScheme(tok.to_string()))
            }
        })
        .collect()
}

fn compile_regex(field: &'static str, pattern: &str) -> Result<Regex, PredicateError> {
    Regex::new(&format!("(?i){pattern}")).map_err(|source| PredicateError::BadRegex { field, source })
}

impl MatchPredicate {
    pub fn builder() -> MatchPredicateBuilder {
        MatchPredicateBuilder::new()
    }

    /// The predicate that always matches, used for filters (like the
    /// standard header filter) installed unconditionally.
    pub fn always() -> Self {
        Self::builder()
            .mime(None::<String>)
            .method("OPTIONS, GET, HEAD, POST, PUT, DELETE, TRACE, CONNECT")
            .scheme("http")
            .build()
            .expect("the always-match predicate is statically valid")
    }

    pub fn matches(&self, request: &Request, response: Option<&Response>) -> bool {
        if !self.methods.iter().any(|m| *m == request.method) {
            return false;
        }

        let scheme = request.uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
        if !self.schemes.iter().any(|s| s == &scheme) {
            return false;
        }

        let authority = request.uri.authority().map(|a| a.as_str()).unwrap_or("");
        if !self.host.is_match(authority) {
            return false;
        }

        if !self.path.is_match(request.uri.path()) {
            return false;
        }

        let query = request.uri.query().unwrap_or("");
        if !self.query.is_match(query) {
            return false;
        }

        if let Some(response) = response {
            let content_type = response.headers.get_first("content-type");
            match (&self.mime, self.mime_requires_absent, content_type) {
                (_, true, Some(_)) => return false,
                (_, true, None) => {}
                (None, false, _) => {}
                (Some(glob), false, Some(ct)) => {
                    if !glob.matches(ct) {
                        return false;
                    }
                }
                (Some(_), false, None) => return false,
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HttpVersion;

    fn req(method: Method, uri: &str) -> Request {
        Request::new(method, uri.parse().unwrap(), HttpVersion::Http11)
    }

    #[test]
    fn default_predicate_matches_typical_get() {
        let p = MatchPredicate::builder().build().unwrap();
        let r = req(Method::GET, "http://example.com/foo");
        assert!(p.matches(&r, None));
    }

    #[test]
    fn method_list_excludes_unlisted_methods() {
        let p = MatchPredicate::builder().method("GET").build().unwrap();
        assert!(p.matches(&req(Method::GET, "http://e.com/"), None));
        assert!(!p.matches(&req(Method::POST, "http://e.com/"), None));
    }

    #[test]
    fn unsupported_scheme_rejected_at_construction() {
        let err = MatchPredicate::builder().scheme("gopher").build().unwrap_err();
        assert!(matches!(err, PredicateError::UnsupportedScheme(_)));
    }

    #[test]
    fn invalid_regex_rejected_at_construction() {
        let err = MatchPredicate::builder().path("(unclosed").build().unwrap_err();
        assert!(matches!(err, PredicateError::BadRegex { field: "path", .. }));
    }

    #[test]
    fn mime_glob_matches_text_star() {
        let p = MatchPredicate::builder().build().unwrap(); // default text/*
        let mut resp = Response::new(http::StatusCode::OK, HttpVersion::Http11);
        resp.headers.append("Content-Type", "text/html; charset=utf-8");
        let r = req(Method::GET, "http://e.com/");
        assert!(p.matches(&r, Some(&resp)));

        resp.headers.set("Content-Type", "image/png");
        assert!(!p.matches(&r, Some(&resp)));
    }

    #[test]
    fn empty_mime_requires_absent_content_type() {
        let p = MatchPredicate::builder().mime(Some("")).build().unwrap();
        let r = req(Method::GET, "http://e.com/");
        let resp_no_ct = Response::new(http::StatusCode::NO_CONTENT, HttpVersion::Http11);
        assert!(p.matches(&r, Some(&resp_no_ct)));

        let mut resp_with_ct = Response::new(http::StatusCode::OK, HttpVersion::Http11);
        resp_with_ct.headers.append("Content-Type", "text/plain");
        assert!(!p.matches(&r, Some(&resp_with_ct)));
    }

    #[test]
    fn none_mime_matches_anything() {
        let p = MatchPredicate::builder().mime(None::<String>).build().unwrap();
        let r = req(Method::GET, "http://e.com/");
        let mut resp = Response::new(http::StatusCode::OK, HttpVersion::Http11);
        resp.headers.append("Content-Type", "application/octet-stream");
        assert!(p.matches(&r, Some(&resp)));
    }

    #[test]
    fn host_regex_is_case_insensitive() {
        let p = MatchPredicate::builder().host("EXAMPLE\\.com").build().unwrap();
        assert!(p.matches(&req(Method::GET, "http://example.com/"), None));
    }
}
