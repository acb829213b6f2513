//! SOCKS5 wire types (RFC 1928) and the request/reply codec.
//!
//! Both endpoints speak SOCKS5: the client toward local applications and the
//! server inside the stripped transport. The codec here works over any
//! bidirectional byte-stream; it never sees the carrier protocol.

pub mod client;
pub mod server;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// SOCKS protocol version byte.
pub const VERSION: u8 = 0x05;
/// Username/password subnegotiation version byte (RFC 1929).
pub const AUTH_VERSION: u8 = 0x01;

/// Method byte: no authentication required.
pub const METHOD_NONE: u8 = 0x00;
/// Method byte: username/password (RFC 1929).
pub const METHOD_PASSWORD: u8 = 0x02;
/// Method byte: no acceptable methods.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Request command (RFC 1928 §4). Only CONNECT is serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Establish a TCP connection to the target
    Connect,
    /// Reverse-connection listener (not serviced)
    Bind,
    /// UDP relay association (not serviced)
    UdpAssociate,
}

impl Command {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(Error::protocol(format!("unknown command: 0x{:02x}", v))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::UdpAssociate => 0x03,
        }
    }
}

/// Reply code (RFC 1928 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(ReplyCode::Succeeded),
            0x01 => Ok(ReplyCode::GeneralFailure),
            0x02 => Ok(ReplyCode::NotAllowed),
            0x03 => Ok(ReplyCode::NetworkUnreachable),
            0x04 => Ok(ReplyCode::HostUnreachable),
            0x05 => Ok(ReplyCode::ConnectionRefused),
            0x06 => Ok(ReplyCode::TtlExpired),
            0x07 => Ok(ReplyCode::CommandNotSupported),
            0x08 => Ok(ReplyCode::AddressTypeNotSupported),
            _ => Err(Error::protocol(format!("unknown reply code: 0x{:02x}", v))),
        }
    }

    /// Map an error to the closest reply code.
    pub fn from_error(e: &Error) -> Self {
        match e {
            Error::Auth | Error::Blocked => ReplyCode::NotAllowed,
            Error::Timeout(_) => ReplyCode::HostUnreachable,
            Error::AddressType(_) => ReplyCode::AddressTypeNotSupported,
            Error::Upstream(code) => {
                ReplyCode::from_u8(*code).unwrap_or(ReplyCode::GeneralFailure)
            }
            Error::Network(io) => match io.kind() {
                std::io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset => ReplyCode::ConnectionRefused,
                std::io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
                std::io::ErrorKind::NotFound => ReplyCode::HostUnreachable,
                _ => ReplyCode::GeneralFailure,
            },
            _ => ReplyCode::GeneralFailure,
        }
    }
}

/// A destination address as carried on the wire.
///
/// The domain form keeps the literal bytes the application supplied; it is
/// resolved only when the outbound connection is dialed, never earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Concrete IPv4 or IPv6 socket address
    Ip(SocketAddr),
    /// Unresolved domain name plus port
    Domain(String, u16),
}

impl Address {
    /// The destination port.
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(sa) => sa.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// The domain component, if this is a domain address.
    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::Ip(_) => None,
            Address::Domain(d, _) => Some(d),
        }
    }

    /// The IP component, if this is a concrete address.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(sa) => Some(sa.ip()),
            Address::Domain(..) => None,
        }
    }

    /// Read an address (ATYP + ADDR + PORT) from the stream.
    pub async fn read_from<S>(stream: &mut S) -> Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                let port = stream.read_u16().await?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let len = stream.read_u8().await? as usize;
                if len == 0 {
                    return Err(Error::protocol("empty domain name"));
                }
                let mut name = vec![0u8; len];
                stream.read_exact(&mut name).await?;
                let port = stream.read_u16().await?;
                let name = String::from_utf8(name)
                    .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?;
                Ok(Address::Domain(name, port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                let port = stream.read_u16().await?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            other => Err(Error::AddressType(other)),
        }
    }

    /// Append the wire encoding (ATYP + ADDR + PORT) to a buffer.
    pub fn write_to_buf(&self, buf: &mut Vec<u8>) {
        match self {
            Address::Ip(SocketAddr::V4(sa)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&sa.ip().octets());
                buf.extend_from_slice(&sa.port().to_be_bytes());
            }
            Address::Ip(SocketAddr::V6(sa)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&sa.ip().octets());
                buf.extend_from_slice(&sa.port().to_be_bytes());
            }
            Address::Domain(name, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Address::Ip(sa)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(sa) => write!(f, "{}", sa),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// A parsed request frame: VER CMD RSV ATYP ADDR PORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Address,
}

impl Request {
    /// Create a CONNECT request for the given destination.
    pub fn connect(address: Address) -> Self {
        Request {
            command: Command::Connect,
            address,
        }
    }

    /// Read and validate a request frame.
    pub async fn read_from<S>(stream: &mut S) -> Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::protocol(format!(
                "bad request version: 0x{:02x}",
                head[0]
            )));
        }
        if head[2] != 0x00 {
            return Err(Error::protocol(format!(
                "non-zero reserved byte: 0x{:02x}",
                head[2]
            )));
        }
        let command = Command::from_u8(head[1])?;
        let address = Address::read_from(stream).await?;
        Ok(Request { command, address })
    }

    /// Write the request frame and flush it.
    pub async fn write_to<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(22);
        buf.push(VERSION);
        buf.push(self.command.as_u8());
        buf.push(0x00);
        self.address.write_to_buf(&mut buf);
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// A reply frame: VER REP RSV ATYP BND.ADDR BND.PORT.
///
/// The bound address is always a concrete socket address; the domain form
/// never appears in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub bind: SocketAddr,
}

impl Reply {
    /// A successful reply carrying the bound address of the outbound socket.
    pub fn success(bind: SocketAddr) -> Self {
        Reply {
            code: ReplyCode::Succeeded,
            bind,
        }
    }

    /// A failure reply with the all-zero bound address.
    pub fn failure(code: ReplyCode) -> Self {
        Reply {
            code,
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }

    /// Read a reply frame.
    pub async fn read_from<S>(stream: &mut S) -> Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::protocol(format!(
                "bad reply version: 0x{:02x}",
                head[0]
            )));
        }
        let code = ReplyCode::from_u8(head[1])?;
        let bind = match Address::read_from(stream).await? {
            Address::Ip(sa) => sa,
            Address::Domain(..) => {
                return Err(Error::protocol("reply carried a domain bound address"))
            }
        };
        Ok(Reply { code, bind })
    }

    /// Write the reply frame and flush it.
    ///
    /// Flushing here is what guarantees the reply reaches the wire before any
    /// relayed payload bytes.
    pub async fn write_to<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(22);
        buf.push(VERSION);
        buf.push(self.code as u8);
        buf.push(0x00);
        Address::Ip(self.bind).write_to_buf(&mut buf);
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }
}
