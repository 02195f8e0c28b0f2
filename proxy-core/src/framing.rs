//! Shared HTTP/1.x body-framing primitives: chunk-size lines, trailers, and
//! the "pending bytes we over-read while scanning for a delimiter" idiom
//! used by both the upstream client (reading responses) and the connection
//! server (reading request bodies). Generic over `Read` so both a
//! `BufReader<TcpStream>` and a plain `TcpStream` can use it directly.

use std::io::{self, ErrorKind, Read};

/// Pulls `n` bytes, preferring whatever is already buffered in `pending`
/// before reading more off the wire.
pub fn read_exact_with_pending<R: Read>(reader: &mut R, pending: &mut Vec<u8>, n: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(n);
    let take = n.min(pending.len());
    out.extend(pending.drain(..take));
    if out.len() < n {
        let mut rest = vec![0u8; n - out.len()];
        reader.read_exact(&mut rest)?;
        out.extend(rest);
    }
    Ok(out)
}

/// Reads one `\r\n`-terminated line, consuming `pending` first.
pub fn read_line_with_pending<R: Read>(reader: &mut R, pending: &mut Vec<u8>) -> io::Result<String> {
    loop {
        if let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = pending.drain(..pos + 2).collect();
            return Ok(String::from_utf8_lossy(&line[..line.len() - 2]).into_owned());
        }
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        pending.push(byte[0]);
        if pending.len() > 16 * 1024 {
            return Err(io::Error::new(ErrorKind::InvalidData, "chunk metadata line too long"));
        }
    }
}

/// Reads a chunk-size line (`hex[;ext] CRLF`) and returns the decoded size.
pub fn read_chunk_size_line<R: Read>(reader: &mut R, pending: &mut Vec<u8>) -> io::Result<usize> {
    let line = read_line_with_pending(reader, pending)?;
    let size_token = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_token, 16).map_err(|_| io::Error::new(ErrorKind::InvalidData, "malformed chunk size"))
}

/// Consumes the CRLF that terminates a chunk's data.
pub fn consume_crlf<R: Read>(reader: &mut R, pending: &mut Vec<u8>) -> io::Result<()> {
    let _ = read_line_with_pending(reader, pending)?;
    Ok(())
}

/// Drains trailer header lines up to and including the terminating blank
/// line of a chunked body.
pub fn drain_trailers<R: Read>(reader: &mut R, pending: &mut Vec<u8>) -> io::Result<()> {
    loop {
        let line = read_line_with_pending(reader, pending)?;
        if line.is_empty() {
            return Ok(());
        }
    }
}
