//! Transport layering.
//!
//! Every carrier presents the same bidirectional byte-stream contract; the
//! SOCKS5 codec and the relay never see which disguise is underneath.
//! Wrappers compose by construction: `wss` is TLS applied to the TCP stream,
//! then the WebSocket strip applied to the TLS stream.

pub mod http;
pub mod ssh;
pub mod tls;
pub mod ws;

use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// The uniform byte-stream contract all carriers present.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A carrier stream with the framing stripped off.
pub type BoxStream = Box<dyn Stream>;

/// The configured carrier protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Http,
    Https,
    Ws,
    Wss,
    Ssh,
}

impl TransportKind {
    /// Whether this kind runs a TLS layer under the carrier.
    pub fn needs_tls(self) -> bool {
        matches!(
            self,
            TransportKind::Tls | TransportKind::Https | TransportKind::Wss
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Http => "http",
            TransportKind::Https => "https",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
            TransportKind::Ssh => "ssh",
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "tls" => Ok(TransportKind::Tls),
            "http" => Ok(TransportKind::Http),
            "https" => Ok(TransportKind::Https),
            "ws" => Ok(TransportKind::Ws),
            "wss" => Ok(TransportKind::Wss),
            "ssh" => Ok(TransportKind::Ssh),
            other => Err(Error::config(format!("unknown protocol: {:?}", other))),
        }
    }
}

/// A stream with bytes that were read past a parsed handshake staged in
/// front of it. Reads drain the staged bytes first; writes pass through.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        PrefixedStream {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.prefix[pos..pos + n]);
            self.pos += n;
            if self.pos == self.prefix.len() {
                self.prefix = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Dial a target with the connect timeout. Domain destinations are
/// resolved here, at connect time, never earlier.
pub(crate) async fn dial(addr: String) -> Result<TcpStream> {
    let attempt = async {
        let mut resolved = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
        let first = resolved
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))?;
        TcpStream::connect(first).await
    };
    match tokio::time::timeout(crate::CONNECT_TIMEOUT, attempt).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::timeout(format!("connect to {}", addr))),
    }
}

/// Client-side transport factory.
///
/// Built once from the client configuration; every proxied connection calls
/// [`Connector::connect`] to get a fresh stripped stream to the upstream
/// server. The SSH variant keeps one authenticated session and hands out
/// channels from it.
pub struct Connector {
    kind: TransportKind,
    server_addr: String,
    server_host: String,
    http_path: String,
    ws_path: String,
    tls: Option<tls::TlsClient>,
    ssh: Option<ssh::SshConnector>,
}

impl Connector {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let tls = if config.kind.needs_tls() {
            Some(tls::TlsClient::new(
                &config.server_host,
                config.tls_ca.as_deref(),
                config.tls_skip_verify,
            )?)
        } else {
            None
        };

        let ssh = if config.kind == TransportKind::Ssh {
            Some(ssh::SshConnector::new(config)?)
        } else {
            None
        };

        Ok(Connector {
            kind: config.kind,
            server_addr: config.server_addr.clone(),
            server_host: config.server_host.clone(),
            http_path: config.http_path.clone(),
            ws_path: config.ws_path.clone(),
            tls,
            ssh,
        })
    }

    /// Open a transport-wrapped connection to the upstream server.
    pub async fn connect(&self) -> Result<BoxStream> {
        if let Some(ssh) = &self.ssh {
            // Channels multiplex over one authenticated session.
            return ssh.open_channel().await;
        }

        let stream = TcpStream::connect(&self.server_addr).await?;
        stream.set_nodelay(true)?;

        match self.kind {
            TransportKind::Tcp | TransportKind::Ssh => Ok(Box::new(stream)),
            TransportKind::Tls => {
                let tls = self.tls_client()?;
                Ok(Box::new(tls.connect(stream).await?))
            }
            TransportKind::Http => Ok(Box::new(
                http::connect(stream, &self.server_host, &self.http_path).await?,
            )),
            TransportKind::Https => {
                let tls = self.tls_client()?;
                let stream = tls.connect(stream).await?;
                Ok(Box::new(
                    http::connect(stream, &self.server_host, &self.http_path).await?,
                ))
            }
            TransportKind::Ws => Ok(Box::new(
                ws::connect(stream, &self.server_host, &self.ws_path).await?,
            )),
            TransportKind::Wss => {
                let tls = self.tls_client()?;
                let stream = tls.connect(stream).await?;
                Ok(Box::new(
                    ws::connect(stream, &self.server_host, &self.ws_path).await?,
                ))
            }
        }
    }

    fn tls_client(&self) -> Result<&tls::TlsClient> {
        self.tls
            .as_ref()
            .ok_or_else(|| Error::config("TLS transport selected without TLS configuration"))
    }
}
