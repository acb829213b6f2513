//! WebSocket carrier (RFC 6455, binary messages only, no extensions).
//!
//! The handshake is an HTTP/1.1 upgrade keyed on the configured path; any
//! other request gets a `404` and the connection stays open, exactly like
//! the plain HTTP carrier. After the upgrade each write becomes one binary
//! message and inbound messages larger than the caller's buffer are staged
//! in a per-connection buffer, returned on subsequent reads.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};
use crate::transport::http::{content_length, discard_body, read_head};
use crate::transport::Stream;

/// Handshake GUID fixed by RFC 6455 §1.3.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on a single inbound message.
const MAX_MESSAGE_SIZE: usize = 1 << 20;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xa;

const RESPONSE_404: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

/// Compute the `Sec-WebSocket-Accept` value for a key.
fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Encode one frame. Client-to-server frames carry a mask.
fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(14 + payload.len());
    buf.push(0x80 | opcode);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload.len() < 126 {
        buf.push(mask_bit | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        buf.push(mask_bit | 126);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        buf.push(mask_bit | 127);
        buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            buf.extend_from_slice(&key);
            buf.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(i, b)| *b ^ key[i % 4]),
            );
        }
        None => buf.extend_from_slice(payload),
    }
    buf
}

/// Try to decode one complete frame from the front of `buf`.
/// Returns `None` when more bytes are needed.
fn decode_frame(buf: &mut BytesMut) -> io::Result<Option<(u8, Vec<u8>)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let opcode = buf[0] & 0x0f;
    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7f) as usize;

    let mut header_len = 2;
    let payload_len = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            header_len += 2;
            u16::from_be_bytes([buf[2], buf[3]]) as usize
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            header_len += 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(bytes);
            if len > MAX_MESSAGE_SIZE as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame exceeds maximum message size",
                ));
            }
            len as usize
        }
        n => n,
    };
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum message size",
        ));
    }
    if masked {
        header_len += 4;
    }
    if buf.len() < header_len + payload_len {
        return Ok(None);
    }

    let frame = buf.split_to(header_len + payload_len);
    let mut payload = frame[header_len..].to_vec();
    if masked {
        let key_start = header_len - 4;
        let key: [u8; 4] = [
            frame[key_start],
            frame[key_start + 1],
            frame[key_start + 2],
            frame[key_start + 3],
        ];
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }
    Ok(Some((opcode, payload)))
}

/// A stream speaking binary WebSocket messages over an inner stream.
pub struct WsStream<S> {
    inner: S,
    /// Frames are masked on the client side only
    mask_frames: bool,
    /// Raw bytes not yet decoded into frames
    in_buf: BytesMut,
    /// Decoded payload waiting for the caller; holds the tail of messages
    /// larger than the caller's read buffer
    staged: BytesMut,
    /// Encoded frame bytes not yet written to the inner stream
    out_buf: Vec<u8>,
    out_pos: usize,
    read_closed: bool,
}

impl<S> WsStream<S> {
    fn new(inner: S, mask_frames: bool, initial: Vec<u8>) -> Self {
        WsStream {
            inner,
            mask_frames,
            in_buf: BytesMut::from(&initial[..]),
            staged: BytesMut::new(),
            out_buf: Vec::new(),
            out_pos: 0,
            read_closed: false,
        }
    }
}

impl<S: AsyncRead + Unpin> WsStream<S> {
    /// Decode frames out of `in_buf` until payload is staged, the peer
    /// closes, or more raw bytes are needed.
    fn advance_frames(&mut self) -> io::Result<bool> {
        while self.staged.is_empty() && !self.read_closed {
            match decode_frame(&mut self.in_buf)? {
                Some((opcode, payload)) => match opcode {
                    OPCODE_CONTINUATION | OPCODE_TEXT | OPCODE_BINARY => {
                        self.staged.extend_from_slice(&payload);
                    }
                    OPCODE_CLOSE => self.read_closed = true,
                    OPCODE_PING | OPCODE_PONG => {}
                    other => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("unexpected opcode 0x{:x}", other),
                        ))
                    }
                },
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for WsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.staged.is_empty() {
                let n = self.staged.len().min(buf.remaining());
                buf.put_slice(&self.staged[..n]);
                self.staged.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.read_closed {
                return Poll::Ready(Ok(()));
            }
            if self.advance_frames()? {
                continue;
            }

            let mut chunk = [0u8; 8 * 1024];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut self.inner).poll_read(cx, &mut chunk_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    let filled = chunk_buf.filled();
                    if filled.is_empty() {
                        if self.in_buf.is_empty() {
                            // Clean EOF between messages
                            self.read_closed = true;
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed mid-frame",
                        )));
                    }
                    self.in_buf.extend_from_slice(filled);
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> WsStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out_buf.len() {
            let out_pos = self.out_pos;
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.out_buf[out_pos..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "inner stream refused frame bytes",
                    )))
                }
                Poll::Ready(Ok(n)) => n,
            };
            self.out_pos += n;
        }
        self.out_buf.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Finish the previous frame before accepting a new message.
        match self.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let mask = self.mask_frames.then(rand::random::<[u8; 4]>);
        self.out_buf = encode_frame(OPCODE_BINARY, buf, mask);
        self.out_pos = 0;

        // The message is committed; flushing completes lazily.
        if let Poll::Ready(Err(e)) = self.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

/// Client side: perform the upgrade handshake and verify the accept hash.
pub async fn connect<S>(mut stream: S, host: &str, path: &str) -> Result<WsStream<S>>
where
    S: Stream,
{
    let nonce: [u8; 16] = rand::random();
    let key = BASE64.encode(nonce);
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path, host, key
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(256);
    let head_len = read_head(&mut stream, &mut buf).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buf[..head_len])
        .map_err(|e| Error::protocol(format!("bad upgrade response: {}", e)))?;
    if response.code != Some(101) {
        return Err(Error::protocol(format!(
            "upgrade rejected with status {:?}",
            response.code
        )));
    }

    let accept = response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned())
        .ok_or_else(|| Error::protocol("upgrade response missing accept header"))?;
    if accept != accept_key(&key) {
        return Err(Error::protocol("Sec-WebSocket-Accept mismatch"));
    }

    let leftover = buf.split_off(head_len);
    Ok(WsStream::new(stream, true, leftover))
}

/// Server side: answer upgrade requests on the configured path; everything
/// else gets a `404` and the connection loops for the next request.
pub async fn accept<S>(mut stream: S, path: &str) -> Result<WsStream<S>>
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

        let req_path = request.path.unwrap_or_default().to_string();
        let body_len = content_length(request.headers);
        let upgrade = header_value(request.headers, "upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = header_value(request.headers, "connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        let key = header_value(request.headers, "sec-websocket-key");

        let mut leftover = buf.split_off(head_len);

        match key {
            Some(key) if req_path == path && upgrade && connection => {
                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {}\r\n\r\n",
                    accept_key(&key)
                );
                stream.write_all(response.as_bytes()).await?;
                stream.flush().await?;
                return Ok(WsStream::new(stream, false, leftover));
            }
            _ => {
                tracing::debug!("rejecting {} on websocket port", req_path);
                discard_body(&mut stream, &mut leftover, body_len).await?;
                stream.write_all(RESPONSE_404).await?;
                stream.flush().await?;
                buf = leftover;
            }
        }
    }
}

fn header_value(headers: &[httparse::Header<'_>], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
}
