//! Client endpoint: local SOCKS5 listener and per-destination dispatch.
//!
//! Each accepted application connection is negotiated, classified by the
//! rule engine, and then either blocked, connected directly from this
//! endpoint, or tunneled to the upstream server through the configured
//! transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::relay::relay;
use crate::rules::Action;
use crate::socks::{client as socks_client, server as socks_server};
use crate::socks::{Command, Reply, ReplyCode, Request};
use crate::transport::{dial, BoxStream, Connector};
use crate::{HANDSHAKE_TIMEOUT, IDLE_TIMEOUT};

/// The client endpoint.
pub struct Client {
    config: Arc<ClientConfig>,
    connector: Connector,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector = Connector::new(&config)?;
        Ok(Client {
            config: Arc::new(config),
            connector,
        })
    }

    /// Bind the configured listen address and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        tracing::info!("SOCKS5 listening on {}", self.config.listen);
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
                        if let Err(e) = this.handle_connection(stream, peer).await {
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

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut stream = stream;

        timeout(
            HANDSHAKE_TIMEOUT,
            socks_server::negotiate(&mut stream, self.config.verifier.as_deref()),
        )
        .await??;

        let request = match timeout(HANDSHAKE_TIMEOUT, socks_server::read_request(&mut stream))
            .await
            .map_err(Error::from)
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
            socks_server::write_reply(
                &mut stream,
                &Reply::failure(ReplyCode::CommandNotSupported),
            )
            .await?;
            return Err(Error::protocol("only CONNECT is supported"));
        }

        let action = self.config.rules.classify(&request.address);
        tracing::debug!("{} -> {}: {:?}", peer, request.address, action);

        match action {
            Action::Block => {
                socks_server::write_reply(&mut stream, &Reply::failure(ReplyCode::NotAllowed))
                    .await?;
                Err(Error::Blocked)
            }
            Action::Direct => self.dispatch_direct(stream, &request).await,
            Action::Proxy => self.dispatch_proxy(stream, &request).await,
        }
    }

    /// Open the target from this endpoint and relay.
    async fn dispatch_direct(&self, mut stream: TcpStream, request: &Request) -> Result<()> {
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
        relay(Box::new(stream), Box::new(target), IDLE_TIMEOUT).await
    }

    /// Tunnel through the upstream server and relay.
    ///
    /// The request is forwarded verbatim; the upstream reply is passed back
    /// to the application, and a transport or handshake failure is mapped to
    /// the closest reply code.
    async fn dispatch_proxy(&self, mut stream: TcpStream, request: &Request) -> Result<()> {
        let (upstream, reply) = match self.connect_upstream(request).await {
            Ok(established) => established,
            Err(e) => {
                socks_server::write_reply(&mut stream, &Reply::failure(ReplyCode::from_error(&e)))
                    .await?;
                return Err(e);
            }
        };

        socks_server::write_reply(&mut stream, &reply).await?;
        if reply.code != ReplyCode::Succeeded {
            return Err(Error::Upstream(reply.code as u8));
        }
        relay(Box::new(stream), upstream, IDLE_TIMEOUT).await
    }

    async fn connect_upstream(&self, request: &Request) -> Result<(BoxStream, Reply)> {
        let mut upstream = timeout(HANDSHAKE_TIMEOUT, self.connector.connect())
            .await
            .map_err(|_| Error::timeout("upstream transport handshake"))??;

        let credentials = match (&self.config.username, &self.config.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        };
        timeout(
            HANDSHAKE_TIMEOUT,
            socks_client::handshake(&mut upstream, credentials),
        )
        .await
        .map_err(|_| Error::timeout("upstream negotiation"))??;

        let reply = timeout(HANDSHAKE_TIMEOUT, socks_client::request(&mut upstream, request))
            .await
            .map_err(|_| Error::timeout("upstream request"))??;
        Ok((upstream, reply))
    }
}
