//! Server endpoint: external listener, carrier stripping, CONNECT service.
//!
//! One port serves the configured carrier. TLS-bearing kinds handshake TLS
//! first; the HTTP and WebSocket kinds route on the request path and keep
//! rejecting probes with `404` until the tunnel path shows up; SSH runs its
//! own listener and feeds accepted channels here. Whatever the disguise,
//! the stripped stream then speaks plain SOCKS5.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::auth::Verifier;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::relay::relay;
use crate::socks::server as socks_server;
use crate::socks::{Command, Reply, ReplyCode};
use crate::transport::{dial, http, ssh, tls, ws, BoxStream, TransportKind};
use crate::{HANDSHAKE_TIMEOUT, IDLE_TIMEOUT};

/// The server endpoint.
pub struct Server {
    config: Arc<ServerConfig>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let tls = if config.kind.needs_tls() {
            let cert = config
                .tls_cert
                .as_ref()
                .ok_or_else(|| Error::config("tls.cert is required"))?;
            let key = config
                .tls_key
                .as_ref()
                .ok_or_else(|| Error::config("tls.key is required"))?;
            Some(tls::acceptor(cert, key)?)
        } else {
            None
        };

        Ok(Server {
            config: Arc::new(config),
            tls,
        })
    }

    /// Bind the configured listen address and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        if self.config.kind == TransportKind::Ssh {
            return self.run_ssh().await;
        }
        let listener = TcpListener::bind(self.config.listen).await?;
        tracing::info!(
            "server listening on {} ({})",
            self.config.listen,
            self.config.kind.as_str()
        );
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let this = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = Arc::clone(&this);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            tracing::debug!("connection from {} closed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                }
            }
        }
    }

    async fn run_ssh(&self) -> Result<()> {
        let key = self
            .config
            .ssh_key
            .as_ref()
            .ok_or_else(|| Error::config("ssh.key is required"))?;
        let mut channels =
            ssh::serve(self.config.listen, key, self.config.verifier.clone()).await?;
        tracing::info!("server listening on {} (ssh)", self.config.listen);

        while let Some(stream) = channels.recv().await {
            let verifier = self.config.verifier.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_socks(stream, verifier).await {
                    tracing::debug!("ssh channel closed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let stream = timeout(HANDSHAKE_TIMEOUT, self.strip(stream))
            .await
            .map_err(|_| Error::timeout("transport handshake"))??;
        serve_socks(stream, self.config.verifier.clone()).await
    }

    /// Consume the carrier framing and hand back the inner stream.
    async fn strip(&self, stream: TcpStream) -> Result<BoxStream> {
        match self.config.kind {
            TransportKind::Tcp => Ok(Box::new(stream)),
            TransportKind::Tls => {
                let stream = self.acceptor()?.accept(stream).await?;
                Ok(Box::new(stream))
            }
            TransportKind::Http => Ok(Box::new(
                http::accept(stream, &self.config.http_path).await?,
            )),
            TransportKind::Https => {
                let stream = self.acceptor()?.accept(stream).await?;
                Ok(Box::new(
                    http::accept(stream, &self.config.http_path).await?,
                ))
            }
            TransportKind::Ws => Ok(Box::new(ws::accept(stream, &self.config.ws_path).await?)),
            TransportKind::Wss => {
                let stream = self.acceptor()?.accept(stream).await?;
                Ok(Box::new(ws::accept(stream, &self.config.ws_path).await?))
            }
            TransportKind::Ssh => Err(Error::config("ssh runs its own listener")),
        }
    }

    fn acceptor(&self) -> Result<&TlsAcceptor> {
        self.tls
            .as_ref()
            .ok_or_else(|| Error::config("TLS transport selected without TLS configuration"))
    }
}

/// SOCKS5 service on a stripped stream: negotiate, validate CONNECT, dial
/// the target and relay. The reply carries the outbound socket's concrete
/// bound address and is flushed before any payload moves.
async fn serve_socks(mut stream: BoxStream, verifier: Option<Arc<dyn Verifier>>) -> Result<()> {
    timeout(
        HANDSHAKE_TIMEOUT,
        socks_server::negotiate(&mut stream, verifier.as_deref()),
    )
    .await
    .map_err(|_| Error::timeout("socks negotiation"))??;

    let request = match timeout(HANDSHAKE_TIMEOUT, socks_server::read_request(&mut stream))
        .await
        .map_err(|_| Error::timeout("socks request"))
        .and_then(|r| r)
    {
        Ok(request) => request,
        Err(e) => {
            // A malformed request still gets its one reply frame.
            let _ = socks_server::write_reply(
                &mut stream,
                &Reply::failure(ReplyCode::from_error(&e)),
            )
            .await;
            return Err(e);
        }
    };

    if request.command != Command::Connect {
        socks_server::write_reply(&mut stream, &Reply::failure(ReplyCode::CommandNotSupported))
            .await?;
        return Err(Error::protocol("only CONNECT is supported"));
    }

    let target = match dial(request.address.to_string()).await {
        Ok(target) => target,
        Err(e) => {
            socks_server::write_reply(&mut stream, &Reply::failure(ReplyCode::from_error(&e)))
                .await?;
            return Err(e);
        }
    };
    target.set_nodelay(true)?;
    let bind = target.local_addr()?;

    socks_server::write_reply(&mut stream, &Reply::success(bind)).await?;
    relay(stream, Box::new(target), IDLE_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_tcp_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(ServerConfig {
            listen: addr,
            kind: TransportKind::Tcp,
            http_path: "/".into(),
            ws_path: "/".into(),
            tls_cert: None,
            tls_key: None,
            ssh_key: None,
            verifier: None,
        })
        .unwrap();
        tokio::spawn(server.serve(listener));
        addr
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_0x05() {
        let server = spawn_tcp_server().await;

        let mut conn = TcpStream::connect(server).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x00]);

        // Port 1 on loopback is almost certainly closed.
        let request = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 1];
        conn.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x05);
    }

    #[tokio::test]
    async fn test_reply_precedes_payload_and_relays() {
        // A one-shot target that sends immediately on accept.
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = target_listener.accept().await.unwrap();
            stream.write_all(b"eager payload").await.unwrap();
        });

        let server = spawn_tcp_server().await;
        let mut conn = TcpStream::connect(server).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&target.port().to_be_bytes());
        conn.write_all(&request).await.unwrap();

        // The reply frame arrives first, then the payload.
        let mut reply = [0u8; 10];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], 0x00);

        let mut payload = [0u8; 13];
        conn.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"eager payload");
    }

    #[tokio::test]
    async fn test_greeting_without_auth_method_rejected_when_users_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let users: std::collections::HashMap<String, String> =
            [("alice".to_string(), "s3cret".to_string())].into_iter().collect();
        let server = Server::new(ServerConfig {
            listen: addr,
            kind: TransportKind::Tcp,
            http_path: "/".into(),
            ws_path: "/".into(),
            tls_cert: None,
            tls_key: None,
            ssh_key: None,
            verifier: Some(Arc::new(crate::auth::MapVerifier::new(users))),
        })
        .unwrap();
        tokio::spawn(server.serve(listener));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0xff]);
    }
}
