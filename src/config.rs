//! Configuration loading.
//!
//! The TOML file carries a `[client]` and/or `[server]` table; the CLI
//! subcommand picks which one to run. File-format structs are deserialized,
//! validated, and converted into immutable runtime values that the
//! dispatchers share by reference for the life of the process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::auth::{HtpasswdVerifier, MapVerifier, Verifier};
use crate::error::{Error, Result};
use crate::rules::Rules;
use crate::transport::TransportKind;

/// Top-level configuration file.
#[derive(Deserialize)]
pub struct FileConfig {
    pub client: Option<ClientFileConfig>,
    pub server: Option<ServerFileConfig>,
}

impl FileConfig {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))
    }
}

fn default_listen() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

/// `[client]` table as written in the file.
#[derive(Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub server: UpstreamFileConfig,
    #[serde(default)]
    pub http: PathFileConfig,
    #[serde(default)]
    pub ws: PathFileConfig,
    #[serde(default)]
    pub tls: ClientTlsFileConfig,
    #[serde(default)]
    pub ssh: ClientSshFileConfig,
    pub users: Option<UsersSource>,
    pub rules: Option<RulesSource>,
}

#[derive(Deserialize)]
pub struct UpstreamFileConfig {
    pub protocol: String,
    pub address: String,
}

#[derive(Deserialize)]
pub struct PathFileConfig {
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for PathFileConfig {
    fn default() -> Self {
        PathFileConfig {
            path: default_path(),
        }
    }
}

#[derive(Deserialize, Default)]
pub struct ClientTlsFileConfig {
    #[serde(default)]
    pub skip_verify: bool,
    pub ca: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
pub struct ClientSshFileConfig {
    pub key: Option<PathBuf>,
    pub passphrase: Option<String>,
}

/// `[server]` table as written in the file.
#[derive(Deserialize)]
pub struct ServerFileConfig {
    pub listen: String,
    pub protocol: String,
    #[serde(default)]
    pub http: PathFileConfig,
    #[serde(default)]
    pub ws: PathFileConfig,
    #[serde(default)]
    pub tls: ServerTlsFileConfig,
    #[serde(default)]
    pub ssh: ServerSshFileConfig,
    pub users: Option<UsersSource>,
}

#[derive(Deserialize, Default)]
pub struct ServerTlsFileConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
pub struct ServerSshFileConfig {
    pub key: Option<PathBuf>,
}

/// Credentials either come from an htpasswd file or an inline table.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum UsersSource {
    File(String),
    Inline(HashMap<String, String>),
}

impl UsersSource {
    fn build(&self) -> Result<Arc<dyn Verifier>> {
        match self {
            UsersSource::File(path) => Ok(Arc::new(HtpasswdVerifier::from_file(path)?)),
            UsersSource::Inline(map) => Ok(Arc::new(MapVerifier::new(map.clone()))),
        }
    }
}

/// Rules either come from a rule file or an inline pattern→action table.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RulesSource {
    File(String),
    Inline(HashMap<String, String>),
}

impl RulesSource {
    fn build(&self) -> Result<Rules> {
        match self {
            RulesSource::File(path) => Rules::from_file(path),
            RulesSource::Inline(map) => Rules::from_map(map),
        }
    }
}

/// Immutable runtime configuration for the client endpoint.
pub struct ClientConfig {
    pub listen: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
    pub kind: TransportKind,
    /// Upstream address exactly as configured, for dialing
    pub server_addr: String,
    /// Host component of the upstream address, for TLS and Host headers
    pub server_host: String,
    pub server_port: u16,
    pub http_path: String,
    pub ws_path: String,
    pub tls_skip_verify: bool,
    pub tls_ca: Option<PathBuf>,
    pub ssh_key: Option<PathBuf>,
    pub ssh_passphrase: Option<String>,
    /// Local applications must authenticate when this is set
    pub verifier: Option<Arc<dyn Verifier>>,
    pub rules: Rules,
}

impl ClientFileConfig {
    pub fn into_config(self) -> Result<ClientConfig> {
        let listen: SocketAddr = self
            .listen
            .parse()
            .map_err(|_| Error::config(format!("bad listen address {:?}", self.listen)))?;
        let kind: TransportKind = self.server.protocol.parse()?;
        let (server_host, server_port) = split_host_port(&self.server.address)?;

        let verifier = self.users.as_ref().map(|u| u.build()).transpose()?;
        let rules = match &self.rules {
            Some(source) => source.build()?,
            None => Rules::proxy_all(),
        };

        Ok(ClientConfig {
            listen,
            username: self.username,
            password: self.password,
            kind,
            server_addr: self.server.address,
            server_host,
            server_port,
            http_path: self.http.path,
            ws_path: self.ws.path,
            tls_skip_verify: self.tls.skip_verify,
            tls_ca: self.tls.ca,
            ssh_key: self.ssh.key,
            ssh_passphrase: self.ssh.passphrase,
            verifier,
            rules,
        })
    }
}

/// Immutable runtime configuration for the server endpoint.
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub kind: TransportKind,
    pub http_path: String,
    pub ws_path: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub ssh_key: Option<PathBuf>,
    /// SOCKS and SSH authentication is required when this is set
    pub verifier: Option<Arc<dyn Verifier>>,
}

impl ServerFileConfig {
    pub fn into_config(self) -> Result<ServerConfig> {
        let listen: SocketAddr = self
            .listen
            .parse()
            .map_err(|_| Error::config(format!("bad listen address {:?}", self.listen)))?;
        let kind: TransportKind = self.protocol.parse()?;

        if kind.needs_tls() && (self.tls.cert.is_none() || self.tls.key.is_none()) {
            return Err(Error::config(format!(
                "protocol {:?} requires tls.cert and tls.key",
                kind.as_str()
            )));
        }
        if kind == TransportKind::Ssh && self.ssh.key.is_none() {
            return Err(Error::config("protocol \"ssh\" requires ssh.key"));
        }

        let verifier = self.users.as_ref().map(|u| u.build()).transpose()?;

        Ok(ServerConfig {
            listen,
            kind,
            http_path: self.http.path,
            ws_path: self.ws.path,
            tls_cert: self.tls.cert,
            tls_key: self.tls.key,
            ssh_key: self.ssh.key,
            verifier,
        })
    }
}

/// Split `host:port`, handling bracketed IPv6 literals.
fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| Error::config(format!("bad address {:?}", addr)))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| Error::config(format!("missing port in {:?}", addr)))?;
            (host, port)
        }
        None => addr
            .rsplit_once(':')
            .ok_or_else(|| Error::config(format!("missing port in {:?}", addr)))?,
    };
    let port = port
        .parse()
        .map_err(|_| Error::config(format!("bad port in {:?}", addr)))?;
    if host.is_empty() {
        return Err(Error::config(format!("empty host in {:?}", addr)));
    }
    Ok((host.to_string(), port))
}
