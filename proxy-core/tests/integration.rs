//! Drives a full `Proxy` (SingleProcess engine) against hand-rolled TCP
//! stub origins: identity passthrough, a request-body filter, a streaming
//! response-body filter, a header-filter short-circuit, HTTP/1.1 chunked
//! re-framing, and CONNECT tunneling.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

use bytes::BytesMut;
use http::StatusCode;
use proxy_config::{EngineKind, ProxyConfig};
use proxy_core::context::ProxyContext;
use proxy_core::filters::{BodyFilter, HeaderFilter, MatchPredicate, MessageHead};
use proxy_core::headers::Headers;
use proxy_core::{Proxy, Response, ShutdownToken};

fn test_config() -> ProxyConfig {
    let mut cfg = ProxyConfig::default();
    cfg.host = "127.0.0.1".to_string();
    cfg.port = 0;
    cfg.engine = EngineKind::SingleProcess;
    cfg.max_keep_alive_requests = 1;
    cfg.timeout_secs = 5;
    cfg
}

/// Binds the proxy's listener, hands it to `proxy` on a background thread,
/// and returns the address clients should connect to plus a handle that
/// stops the proxy when dropped.
struct RunningProxy {
    addr: SocketAddr,
    shutdown: ShutdownToken,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
        // Nudge the accept loop past its blocking poll.
        let _ = TcpStream::connect(self.addr);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn spawn_proxy(proxy: Proxy) -> RunningProxy {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = ShutdownToken::local();
    let handle_shutdown = shutdown.clone();
    let handle = std::thread::spawn(move || {
        let _ = proxy.run_on_listener(listener, handle_shutdown);
    });
    RunningProxy { addr, shutdown, handle: Some(handle) }
}

/// Accepts exactly one connection, captures the raw request bytes it
/// received (up to `Content-Length` worth of body), and replies with
/// `response`.
fn stub_origin(response: Vec<u8>) -> (SocketAddr, mpsc::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let request = read_head_and_body(&mut stream);
            let _ = tx.send(request);
            let _ = stream.write_all(&response);
            let _ = stream.flush();
        }
    });
    (addr, rx)
}

fn read_head_and_body(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        let n = stream.read(&mut tmp).unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
            let content_length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body_start = pos + 4;
            while buf.len() < body_start + content_length {
                let n = stream.read(&mut tmp).unwrap_or(0);
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            break;
        }
    }
    buf
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Sends `request` and reads back a full response, decoding chunked
/// transfer-encoding or `Content-Length` framing as appropriate.
fn exchange(addr: SocketAddr, request: &[u8]) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(request).unwrap();
    stream.flush().unwrap();

    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp).expect("reading response headers");
        assert!(n > 0, "connection closed before headers arrived");
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let head_lower = head.to_lowercase();
    let mut body = buf[header_end..].to_vec();

    if head_lower.contains("transfer-encoding: chunked") {
        let mut decoded = Vec::new();
        loop {
            while find(&body, b"\r\n").is_none() {
                let n = stream.read(&mut tmp).unwrap();
                body.extend_from_slice(&tmp[..n]);
            }
            let line_end = find(&body, b"\r\n").unwrap();
            let size = usize::from_str_radix(
                std::str::from_utf8(&body[..line_end]).unwrap().trim(),
                16,
            )
            .unwrap();
            body.drain(..line_end + 2);
            if size == 0 {
                break;
            }
            while body.len() < size + 2 {
                let n = stream.read(&mut tmp).unwrap();
                body.extend_from_slice(&tmp[..n]);
            }
            decoded.extend_from_slice(&body[..size]);
            body.drain(..size + 2);
        }
        (head, decoded)
    } else if let Some(len) = head_lower
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        while body.len() < len {
            let n = stream.read(&mut tmp).unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&tmp[..n]);
        }
        body.truncate(len);
        (head, body)
    } else {
        loop {
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&tmp[..n]),
                Err(_) => break,
            }
        }
        (head, body)
    }
}

#[test]
fn identity_echo_adds_via_and_strips_hop_by_hop() {
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 17\r\nConnection: keep-alive\r\n\r\nidentity-echo-bod".to_vec();
    let (origin_addr, _captured) = stub_origin(response);

    let proxy = Proxy::new(test_config());
    let running = spawn_proxy(proxy);

    let request = format!(
        "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
    );
    let (head, body) = exchange(running.addr, request.as_bytes());

    assert_eq!(&body, b"identity-echo-bod");
    assert!(head.to_lowercase().contains("via:"), "head was:\n{head}");
}

struct UppercaseRequestBody;
impl BodyFilter for UppercaseRequestBody {
    fn filter(
        &self,
        data_inout: &mut BytesMut,
        _carry_out: &mut BytesMut,
        _head: &MessageHead,
        _headers: &Headers,
        _is_last: bool,
        _ctx: &mut ProxyContext,
    ) {
        for b in data_inout.iter_mut() {
            b.make_ascii_uppercase();
        }
    }
}

#[test]
fn post_request_body_filter_transforms_body_before_forwarding() {
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
    let (origin_addr, captured) = stub_origin(response);

    let mut proxy = Proxy::new(test_config());
    proxy.push_request_body_filter(
        MatchPredicate::builder().method("POST").build().unwrap(),
        Box::new(UppercaseRequestBody),
    );
    let running = spawn_proxy(proxy);

    let payload = "hello from the client";
    let request = format!(
        "POST http://{origin_addr}/submit HTTP/1.1\r\nHost: {origin_addr}\r\nContent-Length: {}\r\n\r\n{}",
        payload.len(),
        payload
    );
    let (_head, body) = exchange(running.addr, request.as_bytes());
    assert_eq!(&body, b"ok");

    let received = captured.recv_timeout(Duration::from_secs(5)).unwrap();
    let received = String::from_utf8_lossy(&received);
    assert!(received.contains(&payload.to_uppercase()), "origin saw:\n{received}");
}

struct Rot13Body;
impl BodyFilter for Rot13Body {
    fn filter(
        &self,
        data_inout: &mut BytesMut,
        _carry_out: &mut BytesMut,
        _head: &MessageHead,
        _headers: &Headers,
        _is_last: bool,
        _ctx: &mut ProxyContext,
    ) {
        for b in data_inout.iter_mut() {
            *b = rot13(*b);
        }
    }
}

fn rot13(b: u8) -> u8 {
    match b {
        b'a'..=b'z' => b'a' + (b - b'a' + 13) % 26,
        b'A'..=b'Z' => b'A' + (b - b'A' + 13) % 26,
        other => other,
    }
}

#[test]
fn response_body_filter_streams_rot13_and_reframes_as_chunked() {
    let plaintext = "Uryyb, Jbeyq!"; // "Hello, World!" rot13'd, origin sends this
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        plaintext.len(),
        plaintext
    );
    let (origin_addr, _captured) = stub_origin(response.into_bytes());

    let mut proxy = Proxy::new(test_config());
    proxy.push_response_body_filter(MatchPredicate::builder().build().unwrap(), Box::new(Rot13Body));
    let running = spawn_proxy(proxy);

    let request = format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
    let (head, body) = exchange(running.addr, request.as_bytes());

    assert!(head.to_lowercase().contains("transfer-encoding: chunked"), "head was:\n{head}");
    assert_eq!(&body, b"Hello, World!");
}

struct ApiKeyGate;
impl HeaderFilter for ApiKeyGate {
    fn filter(&self, headers: &mut Headers, head: &MessageHead, ctx: &mut ProxyContext) {
        if headers.get_first("x-api-key").is_none() {
            ctx.response = Some(
                Response::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED, head.version())
                    .with_body("missing X-Api-Key"),
            );
        }
    }
}

#[test]
fn request_header_filter_short_circuits_without_contacting_upstream() {
    // Bind but never accept: if the proxy dispatches upstream the test
    // will hang on connect/read instead of seeing the short-circuit 407.
    let origin = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_addr = origin.local_addr().unwrap();

    let mut proxy = Proxy::new(test_config());
    proxy.push_request_header_filter(
        MatchPredicate::builder().path("^/secure$").build().unwrap(),
        Box::new(ApiKeyGate),
    );
    let running = spawn_proxy(proxy);

    let request = format!("GET http://{origin_addr}/secure HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
    let (head, body) = exchange(running.addr, request.as_bytes());

    assert!(head.starts_with("HTTP/1.1 407"), "head was:\n{head}");
    assert_eq!(&body, b"missing X-Api-Key");
}

#[test]
fn connect_tunnels_bytes_unchanged_in_both_directions() {
    let echo = TcpListener::bind("127.0.0.1:0").unwrap();
    let echo_addr = echo.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = echo.accept() {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let proxy = Proxy::new(test_config());
    let running = spawn_proxy(proxy);

    let mut client = TcpStream::connect(running.addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(client, "CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").unwrap();
    client.flush().unwrap();

    let mut buf = Vec::new();
    let mut tmp = [0u8; 256];
    loop {
        let n = client.read(&mut tmp).unwrap();
        buf.extend_from_slice(&tmp[..n]);
        if find(&buf, b"\r\n\r\n").is_some() {
            break;
        }
    }
    assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 200"));

    client.write_all(b"ping-through-the-tunnel").unwrap();
    client.flush().unwrap();

    let mut echoed = [0u8; 64];
    let n = client.read(&mut echoed).unwrap();
    assert_eq!(&echoed[..n], b"ping-through-the-tunnel");
}
