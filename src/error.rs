//! Error types shared by the client and server endpoints.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while servicing proxy connections.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed frame or handshake; the connection is closed without retry
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credential check or method negotiation failed
    #[error("authentication failed")]
    Auth,

    /// Destination refused by the rule engine
    #[error("destination blocked by rules")]
    Blocked,

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// An operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// SSH session or channel error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Request carried an address type this endpoint cannot service
    #[error("unsupported address type: 0x{0:02x}")]
    AddressType(u8),

    /// The upstream server answered a CONNECT with a failure code
    #[error("upstream replied with code 0x{0:02x}")]
    Upstream(u8),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Check if this error is fatal at startup.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Check if this error indicates an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Auth)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<russh::Error> for Error {
    fn from(e: russh::Error) -> Self {
        Error::Ssh(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout("deadline elapsed".into())
    }
}
