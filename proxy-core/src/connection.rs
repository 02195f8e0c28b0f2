//! Component H: the per-connection request loop.
//!
//! States: `Idle → ReadRequest → Validate → FilterRequest →
//! {ShortCircuit | Dispatch} → StreamResponse → FlushTrailers →
//! {Idle | Closed}`. One `ConnectionHandler` is built once (wrapping the
//! shared, read-only filter stacks) and handed to whichever `Engine`
//! strategy is configured; `serve()` is what each engine calls per
//! accepted connection.

use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use bytes::BytesMut;
use http::{Method, StatusCode, Uri};
use proxy_config::ProxyConfig;

use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::filters::{
    BodyFilterStack, BodyStackState, HeaderFilterStack, HeaderStackState, MessageHead,
};
use crate::framing::{consume_crlf, drain_trailers, read_chunk_size_line, read_exact_with_pending};
use crate::headers::Headers;
use crate::message::{normalize_request_uri, HttpVersion, Request, Response};
use crate::shutdown::ShutdownToken;
use crate::upstream::UpstreamClient;

/// Methods this proxy forwards upstream. `CONNECT` is handled entirely
/// separately (§4.H.1) and never reaches filter selection.
const FORWARDED_METHODS: &[Method] = &[
    Method::OPTIONS,
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::TRACE,
];

/// The four stage stacks (`ReqHdr`, `ReqBody`, `RespHdr`, `RespBody`). Built
/// once at configuration time by the control surface (`proxy.rs`), then
/// shared read-only across every connection.
pub struct FilterStacks {
    pub req_headers: HeaderFilterStack,
    pub req_body: BodyFilterStack,
    pub resp_headers: HeaderFilterStack,
    pub resp_body: BodyFilterStack,
}

impl FilterStacks {
    pub fn new() -> Self {
        Self {
            req_headers: HeaderFilterStack::new(),
            req_body: BodyFilterStack::new(),
            resp_headers: HeaderFilterStack::new(),
            resp_body: BodyFilterStack::new(),
        }
    }
}

impl Default for FilterStacks {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the response body is framed as `Transfer-Encoding: chunked` or
/// sent raw (relying on connection close to mark the end, for HTTP/1.0
/// clients and for bodyless status classes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Chunked,
    Raw,
}

/// Accumulates the "have we written the status line and headers yet"
/// state across the several `on_chunk` callbacks a single response
/// produces.
struct StreamState {
    headers_sent: bool,
    framing: Framing,
    response: Option<Response>,
}

impl StreamState {
    fn new() -> Self {
        Self { headers_sent: false, framing: Framing::Raw, response: None }
    }
}

/// Orchestrates one connection's request loop: parsing, filter dispatch,
/// upstream I/O, and response streaming.
pub struct ConnectionHandler {
    filters: Arc<FilterStacks>,
    upstream: UpstreamClient,
    config: Arc<ProxyConfig>,
}

impl ConnectionHandler {
    pub fn new(filters: Arc<FilterStacks>, config: Arc<ProxyConfig>) -> Self {
        let upstream = UpstreamClient::new(config.chunk, config.timeout());
        Self { filters, upstream, config }
    }

    /// Serves one accepted connection to completion: up to
    /// `max_keep_alive_requests` requests, breaking early on `Connection:
    /// close`, an HTTP/1.0 client without keep-alive, or shutdown.
    pub fn serve(&self, stream: TcpStream, peer_addr: SocketAddr, shutdown: ShutdownToken) {
        let timeout = self.config.timeout();
        let _ = stream.set_read_timeout(Some(timeout));
        let _ = stream.set_write_timeout(Some(timeout));

        let writer = match stream.try_clone() {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "failed to clone client socket, dropping connection");
                return;
            }
        };
        let mut writer = writer;
        let mut reader = BufReader::new(stream);

        let mut ctx = ProxyContext::new(peer_addr);
        let mut req_hdr_state = HeaderStackState::new();
        let mut req_body_state = BodyStackState::new();
        let mut resp_hdr_state = HeaderStackState::new();
        let mut resp_body_state = BodyStackState::new();

        let max_requests = self.config.max_keep_alive_requests.max(1);

        for _ in 0..max_requests {
            if shutdown.is_shutting_down() {
                break;
            }
            ctx.begin_next_request();

            let head = match read_request_head(&mut reader) {
                Ok(None) => break,
                Ok(Some(parsed)) => parsed,
                Err(e) => {
                    tracing::debug!(error = %e, peer = %peer_addr, "malformed request");
                    let resp = ProxyError::MalformedRequest(e.to_string()).to_response(HttpVersion::Http11);
                    let _ = write_simple_response(&mut writer, &resp);
                    break;
                }
            };

            if head.method == Method::CONNECT {
                self.handle_connect(&head.raw_target, reader, writer, &shutdown);
                return;
            }

            let is_final = ctx.served_requests + 1 >= max_requests;
            match self.handle_request(&mut reader, &mut writer, head, &mut ctx, &mut req_hdr_state, &mut req_body_state, &mut resp_hdr_state, &mut resp_body_state, is_final) {
                Ok(ConnectionAction::KeepAlive) => {
                    ctx.served_requests += 1;
                }
                Ok(ConnectionAction::Close) => {
                    ctx.served_requests += 1;
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, peer = %peer_addr, "connection error, closing");
                    break;
                }
            }
        }

        let _ = writer.flush();
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_request(
        &self,
        reader: &mut BufReader<TcpStream>,
        writer: &mut TcpStream,
        head: ParsedRequestLine,
        ctx: &mut ProxyContext,
        req_hdr_state: &mut HeaderStackState,
        req_body_state: &mut BodyStackState,
        resp_hdr_state: &mut HeaderStackState,
        resp_body_state: &mut BodyStackState,
        is_final: bool,
    ) -> std::io::Result<ConnectionAction> {
        let version = head.version;

        let (mut request, leftover) = match self.validate(head) {
            Ok(parsed) => parsed,
            Err(err) => {
                let resp = err.to_response(version);
                write_simple_response(writer, &resp)?;
                return Ok(ConnectionAction::Close);
            }
        };

        // FilterRequest: request-header stack (standard filter first).
        self.filters.req_headers.begin_message(req_hdr_state);
        self.filters.req_headers.select_filters(req_hdr_state, &request, None);
        {
            let head = MessageHead::Request { method: &request.method, uri: &request.uri, version: request.version };
            self.filters.req_headers.filter(req_hdr_state, &mut request.headers, &head, ctx);
            self.filters.req_headers.end_message(req_hdr_state, &head, ctx);
        }

        // Request body is always pulled off the wire and run through the
        // body stack once, whether or not a header filter short-circuited.
        // The client has already sent (or is about to send) it, and it must
        // be drained to keep request framing in sync for the next request on
        // this connection.
        let body = read_request_body(reader, leftover, &request.headers)?;
        let mut data = BytesMut::from(&body[..]);
        {
            let head = MessageHead::Request { method: &request.method, uri: &request.uri, version: request.version };
            self.filters.req_body.begin_message(req_body_state);
            self.filters.req_body.select_filters(req_body_state, &request, None);
            self.filters.req_body.filter(req_body_state, &mut data, &head, &request.headers, true, ctx);
            self.filters.req_body.eod(req_body_state, &head, ctx);
        }
        request.body = data.freeze();
        request.headers.set("Content-Length", request.body.len().to_string());

        if let Some(short_circuit) = ctx.response.take() {
            return self.stream_response(writer, &request, ctx, resp_hdr_state, resp_body_state, ResponseSource::Fixed(short_circuit), is_final);
        }

        ctx.request = Some(request.clone());

        self.stream_response(writer, &request, ctx, resp_hdr_state, resp_body_state, ResponseSource::Upstream, is_final)
    }

    fn validate(&self, head: ParsedRequestLine) -> Result<(Request, Vec<u8>), ProxyError> {
        if !FORWARDED_METHODS.contains(&head.method) {
            return Err(ProxyError::UnsupportedMethod(head.method));
        }

        let uri: Uri = head
            .raw_target
            .parse()
            .map_err(|_| ProxyError::MalformedRequest(format!("invalid request target '{}'", head.raw_target)))?;
        let uri = normalize_request_uri(uri, &head.headers)
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;

        let scheme = uri.scheme_str().unwrap_or("").to_ascii_lowercase();
        if scheme != "http" {
            return Err(ProxyError::UnsupportedScheme(scheme));
        }

        let mut request = Request::new(head.method, uri, head.version);
        request.headers = head.headers;
        Ok((request, head.leftover))
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_response(
        &self,
        writer: &mut TcpStream,
        request: &Request,
        ctx: &mut ProxyContext,
        resp_hdr_state: &mut HeaderStackState,
        resp_body_state: &mut BodyStackState,
        source: ResponseSource,
        is_final: bool,
    ) -> std::io::Result<ConnectionAction> {
        let mut state = StreamState::new();
        let mut io_err: Option<std::io::Error> = None;
        let mut upstream_died = false;

        match source {
            ResponseSource::Fixed(resp) => {
                let body = resp.body.clone();
                self.emit_chunk(writer, request, ctx, resp_hdr_state, resp_body_state, &mut state, &resp, &body, true, is_final, &mut io_err);
            }
            ResponseSource::Upstream => {
                let final_response = self.upstream.simple_request(request, |chunk, resp, is_last| {
                    if io_err.is_some() {
                        return;
                    }
                    self.emit_chunk(writer, request, ctx, resp_hdr_state, resp_body_state, &mut state, resp, chunk, is_last, is_final, &mut io_err);
                });
                if !state.headers_sent && final_response.headers.contains("X-Died") {
                    // Upstream died before any bytes reached the client: the
                    // synthesized 5xx from `ProxyError::Upstream` is still
                    // unsent, so send it now as the connection's response.
                    let body = final_response.body.clone();
                    self.emit_chunk(writer, request, ctx, resp_hdr_state, resp_body_state, &mut state, &final_response, &body, true, is_final, &mut io_err);
                } else if state.headers_sent && final_response.headers.contains("X-Died") {
                    upstream_died = true;
                }
            }
        }

        if let Some(e) = io_err {
            return Err(e);
        }

        writer.flush()?;

        if upstream_died {
            return Ok(ConnectionAction::Close);
        }

        let connection_close_requested = ctx.hop_headers.get_all("connection").any(|v| {
            v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close"))
        });
        let client_wants_close = match request.version {
            HttpVersion::Http11 => connection_close_requested,
            HttpVersion::Http10 => {
                !ctx.hop_headers.get_all("connection").any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("keep-alive")))
            }
        };

        if is_final || client_wants_close {
            Ok(ConnectionAction::Close)
        } else {
            Ok(ConnectionAction::KeepAlive)
        }
    }

    /// Processes and emits one response chunk. On the first call for a
    /// message, also runs the response-header stack, decides framing, and
    /// writes the status line and headers.
    #[allow(clippy::too_many_arguments)]
    fn emit_chunk(
        &self,
        writer: &mut TcpStream,
        request: &Request,
        ctx: &mut ProxyContext,
        resp_hdr_state: &mut HeaderStackState,
        resp_body_state: &mut BodyStackState,
        state: &mut StreamState,
        raw_response: &Response,
        chunk: &[u8],
        is_last: bool,
        is_final_on_connection: bool,
        io_err: &mut Option<std::io::Error>,
    ) {
        if io_err.is_some() {
            return;
        }
        if let Err(e) = self.try_emit_chunk(writer, request, ctx, resp_hdr_state, resp_body_state, state, raw_response, chunk, is_last, is_final_on_connection) {
            *io_err = Some(e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_emit_chunk(
        &self,
        writer: &mut TcpStream,
        request: &Request,
        ctx: &mut ProxyContext,
        resp_hdr_state: &mut HeaderStackState,
        resp_body_state: &mut BodyStackState,
        state: &mut StreamState,
        raw_response: &Response,
        chunk: &[u8],
        is_last: bool,
        is_final_on_connection: bool,
    ) -> std::io::Result<()> {
        if !state.headers_sent {
            let mut resp = raw_response.clone();

            let hdr_head = MessageHead::Response { status: resp.status, version: request.version };
            self.filters.resp_headers.begin_message(resp_hdr_state);
            self.filters.resp_headers.select_filters(resp_hdr_state, request, Some(&resp));
            self.filters.resp_headers.filter(resp_hdr_state, &mut resp.headers, &hdr_head, ctx);
            self.filters.resp_headers.end_message(resp_hdr_state, &hdr_head, ctx);

            self.filters.resp_body.begin_message(resp_body_state);
            self.filters.resp_body.select_filters(resp_body_state, request, Some(&resp));
            let will_modify = self.filters.resp_body.any_selected_will_modify(resp_body_state);

            let no_body = resp.status.is_informational()
                || resp.status == StatusCode::NO_CONTENT
                || resp.status == StatusCode::NOT_MODIFIED
                || request.method == Method::HEAD;

            let framing = if no_body {
                resp.headers.remove("content-length");
                Framing::Raw
            } else if request.version.is_at_least_1_1() {
                resp.headers.remove("content-length");
                resp.headers.set("Transfer-Encoding", "chunked");
                if is_final_on_connection {
                    resp.headers.set("Connection", "close");
                }
                Framing::Chunked
            } else {
                if will_modify {
                    resp.headers.remove("content-length");
                }
                Framing::Raw
            };

            write!(writer, "{} {} {}\r\n", request.version, resp.status.as_u16(), resp.reason_phrase())?;
            write!(writer, "{}", resp.headers)?;
            writer.write_all(b"\r\n")?;

            state.framing = framing;
            state.headers_sent = true;
            state.response = Some(resp);
            ctx.response = state.response.clone();
        }

        let resp = state.response.as_ref().expect("headers were just sent above");
        let body_head = MessageHead::Response { status: resp.status, version: request.version };
        let mut data = BytesMut::from(chunk);
        self.filters.resp_body.filter(resp_body_state, &mut data, &body_head, &resp.headers, is_last, ctx);

        match state.framing {
            Framing::Chunked => {
                if !data.is_empty() {
                    write!(writer, "{:x}\r\n", data.len())?;
                    writer.write_all(&data)?;
                    writer.write_all(b"\r\n")?;
                }
            }
            Framing::Raw => {
                if !data.is_empty() {
                    writer.write_all(&data)?;
                }
            }
        }

        if is_last {
            self.filters.resp_body.eod(resp_body_state, &body_head, ctx);
            if state.framing == Framing::Chunked {
                writer.write_all(b"0\r\n\r\n")?;
            }
        }

        Ok(())
    }

    /// §4.H.1: `CONNECT` tunneling. No filters apply; bytes are spliced
    /// bidirectionally once the target connection succeeds.
    fn handle_connect(&self, target: &str, reader: BufReader<TcpStream>, mut client_writer: TcpStream, shutdown: &ShutdownToken) {
        let addr = match target.to_socket_addrs().ok().and_then(|mut it| it.next()) {
            Some(addr) => addr,
            None => {
                let resp = ProxyError::MalformedRequest(format!("invalid CONNECT target '{target}'")).to_response(HttpVersion::Http11);
                let _ = write_simple_response(&mut client_writer, &resp);
                return;
            }
        };

        let timeout = self.config.timeout();
        let target_stream = match TcpStream::connect_timeout(&addr, timeout) {
            Ok(s) => s,
            Err(e) => {
                let resp = ProxyError::Upstream(e.to_string()).to_response(HttpVersion::Http11);
                let _ = write_simple_response(&mut client_writer, &resp);
                return;
            }
        };
        let _ = target_stream.set_read_timeout(Some(timeout));
        let _ = target_stream.set_write_timeout(Some(timeout));

        if client_writer.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").is_err() {
            return;
        }
        let _ = client_writer.flush();

        let client_read = reader.into_inner();
        let mut client_to_target = match (client_read.try_clone(), target_stream.try_clone()) {
            (Ok(cr), Ok(ts)) => (cr, ts),
            _ => return,
        };
        let mut target_to_client = (target_stream, client_writer);

        let thread_shutdown = shutdown.clone();
        let forward = std::thread::spawn(move || {
            let (mut from, mut to) = client_to_target;
            loop {
                if thread_shutdown.is_shutting_down() {
                    break;
                }
                let mut buf = [0u8; 8192];
                match from.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if to.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => continue,
                    Err(_) => break,
                }
            }
            let _ = to.shutdown(std::net::Shutdown::Write);
        });

        let (mut from, mut to) = (&mut target_to_client.0, &mut target_to_client.1);
        loop {
            if shutdown.is_shutting_down() {
                break;
            }
            let mut buf = [0u8; 8192];
            match from.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if to.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => continue,
                Err(_) => break,
            }
        }
        let _ = to.shutdown(std::net::Shutdown::Write);
        let _ = forward.join();
    }
}

enum ConnectionAction {
    KeepAlive,
    Close,
}

enum ResponseSource {
    Fixed(Response),
    Upstream,
}

struct ParsedRequestLine {
    method: Method,
    raw_target: String,
    version: HttpVersion,
    headers: Headers,
    leftover: Vec<u8>,
}

fn write_simple_response(writer: &mut TcpStream, resp: &Response) -> std::io::Result<()> {
    write!(writer, "{} {} {}\r\n", resp.version, resp.status.as_u16(), resp.reason_phrase())?;
    write!(writer, "Content-Length: {}\r\n", resp.body.len())?;
    write!(writer, "{}", resp.headers)?;
    writer.write_all(b"\r\n")?;
    writer.write_all(&resp.body)?;
    writer.flush()
}

/// Reads the request line and headers off the wire. Returns `Ok(None)` on
/// a clean close (no bytes at all arrived, the common end of a keep-alive
/// connection), or the parsed head plus any body bytes that were
/// over-read in the same `read()` call.
fn read_request_head(reader: &mut BufReader<TcpStream>) -> std::io::Result<ParsedRequestLine> {
    read_request_head_impl(reader)?.ok_or_else(|| std::io::Error::new(ErrorKind::UnexpectedEof, "connection closed"))
}

fn read_request_head_impl<R: Read>(reader: &mut R) -> std::io::Result<Option<ParsedRequestLine>> {
    let mut buf = Vec::with_capacity(2048);
    let mut tmp = [0u8; 2048];
    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(std::io::Error::new(ErrorKind::UnexpectedEof, "client closed mid-request"))
            };
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(std::io::Error::new(ErrorKind::InvalidData, "request headers too large"));
        }
    }

    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = &buf[..header_end];
    let leftover = buf[header_end..].to_vec();

    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers_buf);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(std::io::Error::new(ErrorKind::InvalidData, "malformed request line")),
    }

    let method_str = parsed.method.ok_or_else(|| std::io::Error::new(ErrorKind::InvalidData, "missing method"))?;
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidData, "unrecognized method"))?;
    let raw_target = parsed
        .path
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidData, "missing request target"))?
        .to_string();
    let version = if parsed.version == Some(0) { HttpVersion::Http10 } else { HttpVersion::Http11 };

    let mut headers = Headers::new();
    for h in parsed.headers.iter() {
        headers.append(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
    }

    Ok(Some(ParsedRequestLine { method, raw_target, version, headers, leftover }))
}

/// Reads the full request body, honoring `Transfer-Encoding: chunked` or
/// `Content-Length`; absent either, assumes an empty body.
fn read_request_body(reader: &mut BufReader<TcpStream>, leftover: Vec<u8>, headers: &Headers) -> std::io::Result<Vec<u8>> {
    let mut pending = leftover;
    if headers.get_first("transfer-encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false) {
        let mut body = Vec::new();
        loop {
            let size = read_chunk_size_line(reader, &mut pending)?;
            if size == 0 {
                drain_trailers(reader, &mut pending)?;
                return Ok(body);
            }
            let chunk = read_exact_with_pending(reader, &mut pending, size)?;
            body.extend_from_slice(&chunk);
            consume_crlf(reader, &mut pending)?;
        }
    } else if let Some(len) = headers.get_first("content-length").and_then(|v| v.trim().parse::<usize>().ok()) {
        read_exact_with_pending(reader, &mut pending, len)
    } else {
        Ok(pending)
    }
}
