//! Component I: the upstream client. Opens one TCP connection per
//! dispatched request (no origin-side keep-alive pool in this version, see
//! DESIGN.md), writes the request, and streams the response body back to
//! the caller in fixed-size chunks via a callback.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use http::StatusCode;

use crate::error::ProxyError;
use crate::framing::{consume_crlf, drain_trailers, read_chunk_size_line, read_exact_with_pending};
use crate::message::{HttpVersion, Request, Response};

pub struct UpstreamClient {
    chunk_size: usize,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(chunk_size: usize, timeout: Duration) -> Self {
        Self { chunk_size: chunk_size.max(1), timeout }
    }

    /// Issues `request` and streams the response body to `on_chunk`, which
    /// is called `(data, response, is_last)` once per chunk: the first call
    /// carries the finalized response headers alongside the first body
    /// chunk (which may be empty). On transport failure, a synthesized
    /// `5xx` carrying an `X-Died` header is returned and `on_chunk` is
    /// never called.
    pub fn simple_request(
        &self,
        request: &Request,
        mut on_chunk: impl FnMut(&[u8], &Response, bool),
    ) -> Response {
        match self.run(request, &mut on_chunk) {
            Ok(response) => response,
            Err(e) => ProxyError::Upstream(e.to_string()).to_response(request.version),
        }
    }

    fn run(
        &self,
        request: &Request,
        on_chunk: &mut impl FnMut(&[u8], &Response, bool),
    ) -> std::io::Result<Response> {
        let mut stream = self.connect(request)?;
        self.write_request(&mut stream, request)?;

        let mut reader = std::io::BufReader::new(stream);
        let (response, leftover) = read_response_head(&mut reader)?;

        let skip_body = skip_body_for(request, &response);
        if skip_body {
            on_chunk(&[], &response, true);
            return Ok(response);
        }

        if response.headers.get_first("transfer-encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false) {
            self.stream_chunked(&mut reader, leftover, &response, on_chunk)?;
        } else if let Some(len) = response
            .headers
            .get_first("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.stream_fixed_length(&mut reader, leftover, len, &response, on_chunk)?;
        } else {
            self.stream_until_eof(&mut reader, leftover, &response, on_chunk)?;
        }

        Ok(response)
    }

    fn connect(&self, request: &Request) -> std::io::Result<TcpStream> {
        let authority = request.uri.authority().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "request has no authority")
        })?;
        let host = authority.host();
        let port = authority.port_u16().unwrap_or(80);

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "host did not resolve"))?;

        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    fn write_request(&self, stream: &mut TcpStream, request: &Request) -> std::io::Result<()> {
        let path = request
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        write!(stream, "{} {} {}\r\n", request.method, path, request.version)?;
        write!(stream, "{}", request.headers)?;
        stream.write_all(b"\r\n")?;
        stream.write_all(&request.body)?;
        stream.flush()
    }

    fn stream_chunked(
        &self,
        reader: &mut std::io::BufReader<TcpStream>,
        leftover: Vec<u8>,
        response: &Response,
        on_chunk: &mut impl FnMut(&[u8], &Response, bool),
    ) -> std::io::Result<()> {
        let mut pending = leftover;
        loop {
            let size = read_chunk_size_line(reader, &mut pending)?;
            if size == 0 {
                drain_trailers(reader, &mut pending)?;
                on_chunk(&[], response, true);
                return Ok(());
            }

            let mut remaining = size;
            while remaining > 0 {
                let take = remaining.min(self.chunk_size);
                let buf = read_exact_with_pending(reader, &mut pending, take)?;
                remaining -= buf.len();
                on_chunk(&buf, response, false);
            }
            consume_crlf(reader, &mut pending)?;
        }
    }

    fn stream_fixed_length(
        &self,
        reader: &mut std::io::BufReader<TcpStream>,
        leftover: Vec<u8>,
        len: u64,
        response: &Response,
        on_chunk: &mut impl FnMut(&[u8], &Response, bool),
    ) -> std::io::Result<()> {
        let mut pending = leftover;
        let mut remaining = len;
        if remaining == 0 {
            on_chunk(&[], response, true);
            return Ok(());
        }
        while remaining > 0 {
            let take = remaining.min(self.chunk_size as u64) as usize;
            let buf = read_exact_with_pending(reader, &mut pending, take)?;
            remaining -= buf.len() as u64;
            on_chunk(&buf, response, remaining == 0);
        }
        Ok(())
    }

    fn stream_until_eof(
        &self,
        reader: &mut std::io::BufReader<TcpStream>,
        leftover: Vec<u8>,
        response: &Response,
        on_chunk: &mut impl FnMut(&[u8], &Response, bool),
    ) -> std::io::Result<()> {
        if !leftover.is_empty() {
            on_chunk(&leftover, response, false);
        }
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    on_chunk(&[], response, true);
                    return Ok(());
                }
                Ok(n) => on_chunk(&buf[..n], response, false),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn skip_body_for(request: &Request, response: &Response) -> bool {
    request.method == http::Method::HEAD
        || response.status.is_informational()
        || response.status == StatusCode::NO_CONTENT
        || response.status == StatusCode::NOT_MODIFIED
}

/// Reads off the wire until the full status line + header block has
/// arrived, parses it with `httparse`, and returns the parsed `Response`
/// plus any body bytes that were over-read as part of the same `read()`.
fn read_response_head<R: Read>(reader: &mut R) -> std::io::Result<(Response, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];
    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "upstream closed before sending headers"));
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "upstream response headers too large"));
        }
    }

    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = &buf[..header_end];
    let leftover = buf[header_end..].to_vec();

    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers_buf);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed upstream response"));
        }
    }

    let status = StatusCode::from_u16(parsed.code.unwrap_or(502))
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let version = if parsed.version == Some(0) { HttpVersion::Http10 } else { HttpVersion::Http11 };

    let mut response = Response::new(status, version);
    for h in parsed.headers.iter() {
        response.headers.append(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
    }

    Ok((response, leftover))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HttpVersion;
    use http::Method;

    fn req(method: Method) -> Request {
        Request::new(method, "http://example.com/".parse().unwrap(), HttpVersion::Http11)
    }

    fn resp(status: StatusCode) -> Response {
        Response::new(status, HttpVersion::Http11)
    }

    #[test]
    fn head_requests_skip_body_regardless_of_status() {
        assert!(skip_body_for(&req(Method::HEAD), &resp(StatusCode::OK)));
    }

    #[test]
    fn informational_no_content_and_not_modified_skip_body() {
        assert!(skip_body_for(&req(Method::GET), &resp(StatusCode::CONTINUE)));
        assert!(skip_body_for(&req(Method::GET), &resp(StatusCode::NO_CONTENT)));
        assert!(skip_body_for(&req(Method::GET), &resp(StatusCode::NOT_MODIFIED)));
    }

    #[test]
    fn ordinary_get_does_not_skip_body() {
        assert!(!skip_body_for(&req(Method::GET), &resp(StatusCode::OK)));
    }

    #[test]
    fn read_response_head_parses_status_and_headers_and_keeps_overread_body() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut reader = std::io::Cursor::new(wire);
        let (response, leftover) = read_response_head(&mut reader).unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get_first("content-length"), Some("5"));
        assert_eq!(leftover, b"hello");
    }
}

