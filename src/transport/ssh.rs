//! SSH carrier (RFC 4251/4252/4254).
//!
//! Proxied connections ride `direct-tcpip` channels. The client keeps one
//! authenticated session and opens a channel per connection, re-establishing
//! the session when it dies. The server accepts channels and hands their
//! streams to the SOCKS5 handler regardless of the requested target.
//!
//! Host keys are not verified on the client (a warning is logged); the
//! server's host key comes from the configured key file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, MethodSet};
use russh_keys::key;
use tokio::sync::{mpsc, Mutex};

use crate::auth::Verifier;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::BoxStream;

/// Client-side SSH session cache and channel factory.
pub struct SshConnector {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    key: Option<PathBuf>,
    passphrase: Option<String>,
    session: Mutex<Option<client::Handle<ClientHandler>>>,
}

impl SshConnector {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let username = config
            .username
            .clone()
            .ok_or_else(|| Error::config("ssh transport requires a username"))?;
        if config.password.is_none() && config.ssh_key.is_none() {
            return Err(Error::config(
                "ssh transport requires a password or a key file",
            ));
        }

        Ok(SshConnector {
            host: config.server_host.clone(),
            port: config.server_port,
            username,
            password: config.password.clone(),
            key: config.ssh_key.clone(),
            passphrase: config.ssh_passphrase.clone(),
            session: Mutex::new(None),
        })
    }

    /// Open a `direct-tcpip` channel, reusing the cached session when it is
    /// still alive.
    pub async fn open_channel(&self) -> Result<BoxStream> {
        let mut session = self.session.lock().await;

        if let Some(handle) = session.as_ref() {
            if !handle.is_closed() {
                match self.open_on(handle).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        tracing::debug!("cached SSH session unusable, reconnecting: {}", e)
                    }
                }
            }
        }

        let handle = self.establish().await?;
        let stream = self.open_on(&handle).await?;
        *session = Some(handle);
        Ok(stream)
    }

    async fn open_on(&self, handle: &client::Handle<ClientHandler>) -> Result<BoxStream> {
        let channel = handle
            .channel_open_direct_tcpip(self.host.clone(), self.port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn establish(&self) -> Result<client::Handle<ClientHandler>> {
        let config = Arc::new(client::Config::default());
        let mut handle =
            client::connect(config, (self.host.as_str(), self.port), ClientHandler).await?;

        let mut authenticated = false;
        if let Some(password) = &self.password {
            authenticated = handle
                .authenticate_password(self.username.clone(), password.clone())
                .await?;
        }
        if !authenticated {
            if let Some(path) = &self.key {
                let pair = russh_keys::load_secret_key(path, self.passphrase.as_deref())
                    .map_err(|e| Error::Ssh(format!("cannot load key {}: {}", path.display(), e)))?;
                authenticated = handle
                    .authenticate_publickey(self.username.clone(), Arc::new(pair))
                    .await?;
            }
        }
        if !authenticated {
            return Err(Error::Auth);
        }

        tracing::debug!("SSH session established to {}:{}", self.host, self.port);
        Ok(handle)
    }
}

struct ClientHandler;

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        tracing::warn!("accepting SSH host key without verification");
        Ok(true)
    }
}

/// Start an SSH server on `listen` and return a receiver of accepted
/// `direct-tcpip` channel streams.
pub async fn serve(
    listen: SocketAddr,
    host_key: &PathBuf,
    verifier: Option<Arc<dyn Verifier>>,
) -> Result<mpsc::Receiver<BoxStream>> {
    let key = russh_keys::load_secret_key(host_key, None)
        .map_err(|e| Error::config(format!("cannot load host key {}: {}", host_key.display(), e)))?;

    let config = Arc::new(server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![key],
        ..Default::default()
    });

    let (tx, rx) = mpsc::channel(64);
    let mut ssh_server = SshServer { verifier, tx };

    tokio::spawn(async move {
        if let Err(e) = ssh_server.run_on_address(config, listen).await {
            tracing::warn!("SSH listener error: {}", e);
        }
    });

    Ok(rx)
}

struct SshServer {
    verifier: Option<Arc<dyn Verifier>>,
    tx: mpsc::Sender<BoxStream>,
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshSession {
        tracing::debug!("SSH connection from {:?}", peer);
        SshSession {
            verifier: self.verifier.clone(),
            tx: self.tx.clone(),
        }
    }
}

struct SshSession {
    verifier: Option<Arc<dyn Verifier>>,
    tx: mpsc::Sender<BoxStream>,
}

#[async_trait::async_trait]
impl server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        match &self.verifier {
            None => Ok(Auth::Accept),
            Some(v) if v.verify(user, password) => Ok(Auth::Accept),
            Some(_) => {
                tracing::debug!("SSH password rejected for user {:?}", user);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &key::PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        // Only password auth is wired to the shared verifier.
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD),
        })
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        // The requested target is ignored: the channel carries SOCKS5 and
        // the real destination arrives inside it.
        if self.tx.send(Box::new(channel.into_stream())).await.is_err() {
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rules;
    use crate::transport::TransportKind;

    fn ssh_client_config() -> ClientConfig {
        ClientConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            username: Some("alice".into()),
            password: Some("s3cret".into()),
            kind: TransportKind::Ssh,
            server_addr: "ssh.example:22".into(),
            server_host: "ssh.example".into(),
            server_port: 22,
            http_path: "/".into(),
            ws_path: "/".into(),
            tls_skip_verify: false,
            tls_ca: None,
            ssh_key: None,
            ssh_passphrase: None,
            verifier: None,
            rules: Rules::proxy_all(),
        }
    }

    #[test]
    fn test_connector_requires_username() {
        let mut config = ssh_client_config();
        config.username = None;
        let err = match SshConnector::new(&config) {
            Ok(_) => panic!("expected error"),
            Err(err) => err,
        };
        assert!(err.is_config());
    }

    #[test]
    fn test_connector_requires_password_or_key() {
        let mut config = ssh_client_config();
        config.password = None;
        config.ssh_key = None;
        let err = match SshConnector::new(&config) {
            Ok(_) => panic!("expected error"),
            Err(err) => err,
        };
        assert!(err.is_config());
    }

    #[test]
    fn test_connector_accepts_password_only() {
        let connector = SshConnector::new(&ssh_client_config()).unwrap();
        assert_eq!(connector.username, "alice");
        assert_eq!(connector.port, 22);
    }

    #[test]
    fn test_connector_accepts_key_only() {
        let mut config = ssh_client_config();
        config.password = None;
        config.ssh_key = Some("/home/alice/.ssh/id_ed25519".into());
        assert!(SshConnector::new(&config).is_ok());
    }
}
