//! HTTP/1.1 CONNECT carrier.
//!
//! The client opens the tunnel with a CONNECT request on the configured
//! path; the server answers `200 OK` and both sides go transparent. A
//! request for any other path gets a plain `404 Not Found` and the
//! connection stays open for further requests, so a casual probe sees an
//! unremarkable web server.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::transport::{PrefixedStream, Stream};

/// Upper bound on a request or response head.
const MAX_HEAD_SIZE: usize = 8 * 1024;

const RESPONSE_404: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

/// Read from `stream` into `buf` until the head terminator; returns the
/// offset one past the final `\r\n\r\n`. Bytes already in `buf` are
/// considered first, so pipelined requests are not lost.
pub(crate) async fn read_head<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut scanned: usize = 0;
    loop {
        if buf.len() >= 4 {
            let start = scanned.saturating_sub(3);
            if let Some(pos) = find_terminator(&buf[start..]) {
                return Ok(start + pos + 4);
            }
            scanned = buf.len();
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::protocol("HTTP head too large"));
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed mid-head"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Pull `length` body bytes out of the leftover buffer and the stream,
/// discarding them.
pub(crate) async fn discard_body<S>(
    stream: &mut S,
    leftover: &mut Vec<u8>,
    length: u64,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut remaining = length as usize;
    let from_buf = remaining.min(leftover.len());
    leftover.drain(..from_buf);
    remaining -= from_buf;

    let mut chunk = [0u8; 1024];
    while remaining > 0 {
        let n = stream.read(&mut chunk[..remaining.min(1024)]).await?;
        if n == 0 {
            return Err(Error::protocol("connection closed mid-body"));
        }
        remaining -= n;
    }
    Ok(())
}

pub(crate) fn content_length(headers: &[httparse::Header<'_>]) -> u64 {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Client side: open the tunnel with a CONNECT request and validate the
/// `200` response head; everything after it passes through untouched.
pub async fn connect<S>(mut stream: S, host: &str, path: &str) -> Result<PrefixedStream<S>>
where
    S: Stream,
{
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, host);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(256);
    let head_len = read_head(&mut stream, &mut buf).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buf[..head_len])
        .map_err(|e| Error::protocol(format!("bad CONNECT response: {}", e)))?;
    match response.code {
        Some(200) => {}
        Some(code) => {
            return Err(Error::protocol(format!(
                "CONNECT rejected with status {}",
                code
            )))
        }
        None => return Err(Error::protocol("incomplete CONNECT response head")),
    }

    let leftover = buf.split_off(head_len);
    Ok(PrefixedStream::new(leftover, stream))
}

/// Server side: consume CONNECT requests until one matches the configured
/// path, answering `404` (and discarding the body) for everything else.
pub async fn accept<S>(mut stream: S, path: &str) -> Result<PrefixedStream<S>>
where
    S: Stream,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        let head_len = read_head(&mut stream, &mut buf).await?;

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut request = httparse::Request::new(&mut headers);
        request
            .parse(&buf[..head_len])
            .map_err(|e| Error::protocol(format!("bad request head: {}", e)))?;

        let method = request.method.unwrap_or_default().to_string();
        let req_path = request.path.unwrap_or_default().to_string();
        let body_len = content_length(request.headers);

        let mut leftover = buf.split_off(head_len);

        if method.eq_ignore_ascii_case("CONNECT") && req_path == path {
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
            stream.flush().await?;
            return Ok(PrefixedStream::new(leftover, stream));
        }

        tracing::debug!("rejecting {} {} on tunnel port", method, req_path);
        discard_body(&mut stream, &mut leftover, body_len).await?;
        stream.write_all(RESPONSE_404).await?;
        stream.flush().await?;
        buf = leftover;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_connect_strips_transparently() {
        let (client_side, server_side) = duplex(4096);

        let client = tokio::spawn(async move {
            let mut s = connect(client_side, "proxy.example:443", "/tunnel").await.unwrap();
            s.write_all(b"payload-up").await.unwrap();
            let mut buf = [0u8; 12];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"payload-down");
        });

        let server = tokio::spawn(async move {
            let mut s = accept(server_side, "/tunnel").await.unwrap();
            let mut buf = [0u8; 10];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"payload-up");
            s.write_all(b"payload-down").await.unwrap();
        });

        client.await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_path_gets_404_and_connection_stays_usable() {
        let (mut probe, server_side) = duplex(4096);

        let server = tokio::spawn(async move { accept(server_side, "/tunnel").await });

        probe
            .write_all(b"GET /admin HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; RESPONSE_404.len()];
        probe.read_exact(&mut buf).await.unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 404"));

        // Same TCP connection, second request succeeds.
        probe
            .write_all(b"CONNECT /tunnel HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 19];
        probe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200 OK\r\n\r\n");

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_probe_body_is_discarded() {
        let (mut probe, server_side) = duplex(4096);

        let server = tokio::spawn(async move { accept(server_side, "/tunnel").await });

        probe
            .write_all(b"POST /submit HTTP/1.1\r\nContent-Length: 4\r\n\r\nBODY")
            .await
            .unwrap();
        let mut buf = vec![0u8; RESPONSE_404.len()];
        probe.read_exact(&mut buf).await.unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 404"));

        probe
            .write_all(b"CONNECT /tunnel HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 19];
        probe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200 OK\r\n\r\n");

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_rejects_non_200() {
        let (client_side, mut far) = duplex(4096);

        let client = tokio::spawn(async move { connect(client_side, "x", "/t").await.map(|_| ()) });

        let mut head = Vec::new();
        read_head(&mut far, &mut head).await.unwrap();
        far.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();

        assert!(client.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bytes_after_head_are_replayed() {
        let (client_side, mut far) = duplex(4096);

        let client = tokio::spawn(async move {
            let mut s = connect(client_side, "x", "/t").await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"early");
        });

        let mut head = Vec::new();
        read_head(&mut far, &mut head).await.unwrap();
        // Response head and first payload bytes arrive in one segment.
        far.write_all(b"HTTP/1.1 200 OK\r\n\r\nearly").await.unwrap();

        client.await.unwrap();
    }
}
