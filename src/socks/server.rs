//! Server side of the SOCKS5 handshake.
//!
//! Drives the greeting, optional RFC 1929 subnegotiation, and request
//! validation for one accepted connection. The same code runs on the local
//! client endpoint (toward applications) and on the remote server endpoint
//! (inside the stripped transport).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::Verifier;
use crate::error::{Error, Result};
use crate::socks::{
    Reply, Request, AUTH_VERSION, METHOD_NONE, METHOD_NO_ACCEPTABLE, METHOD_PASSWORD, VERSION,
};

/// Perform method selection and, when a verifier is configured, the
/// username/password subnegotiation.
///
/// When authentication is required and the peer does not offer method 0x02,
/// the no-acceptable-methods byte is sent and the connection is failed.
pub async fn negotiate<S>(stream: &mut S, verifier: Option<&dyn Verifier>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::protocol(format!(
            "bad greeting version: 0x{:02x}",
            head[0]
        )));
    }
    let nmethods = head[1] as usize;
    if nmethods == 0 {
        return Err(Error::protocol("greeting offered no methods"));
    }
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    match verifier {
        Some(verifier) => {
            if !methods.contains(&METHOD_PASSWORD) {
                stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
                stream.flush().await?;
                return Err(Error::Auth);
            }
            stream.write_all(&[VERSION, METHOD_PASSWORD]).await?;
            stream.flush().await?;
            subnegotiate(stream, verifier).await
        }
        None => {
            if !methods.contains(&METHOD_NONE) {
                stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
                stream.flush().await?;
                return Err(Error::Auth);
            }
            stream.write_all(&[VERSION, METHOD_NONE]).await?;
            stream.flush().await?;
            Ok(())
        }
    }
}

/// RFC 1929 username/password subnegotiation.
async fn subnegotiate<S>(stream: &mut S, verifier: &dyn Verifier) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(Error::protocol(format!(
            "bad auth version: 0x{:02x}",
            version
        )));
    }

    let ulen = stream.read_u8().await? as usize;
    let mut username = vec![0u8; ulen];
    stream.read_exact(&mut username).await?;
    let plen = stream.read_u8().await? as usize;
    let mut password = vec![0u8; plen];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8_lossy(&username);
    let password = String::from_utf8_lossy(&password);

    if verifier.verify(&username, &password) {
        stream.write_all(&[AUTH_VERSION, 0x00]).await?;
        stream.flush().await?;
        Ok(())
    } else {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        stream.flush().await?;
        Err(Error::Auth)
    }
}

/// Read the request frame following a successful negotiation.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    Request::read_from(stream).await
}

/// Emit a reply frame. Exactly one reply is written per accepted request,
/// before any relayed payload.
pub async fn write_reply<S>(stream: &mut S, reply: &Reply) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    reply.write_to(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MapVerifier;
    use tokio::io::duplex;

    fn verifier(user: &str, pass: &str) -> MapVerifier {
        MapVerifier::new([(user.to_string(), pass.to_string())].into_iter().collect())
    }

    #[tokio::test]
    async fn test_negotiate_no_auth() {
        let (mut app, mut proxy) = duplex(256);
        app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        negotiate(&mut proxy, None).await.unwrap();

        let mut reply = [0u8; 2];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_missing_password_method() {
        let (mut app, mut proxy) = duplex(256);
        // Offers only no-auth while the server requires credentials.
        app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let v = verifier("alice", "s3cret");
        let err = negotiate(&mut proxy, Some(&v)).await.unwrap_err();
        assert!(err.is_auth_failure());

        let mut reply = [0u8; 2];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xff]);
    }

    #[tokio::test]
    async fn test_negotiate_password_success() {
        let (mut app, mut proxy) = duplex(256);
        app.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        // ver=1, ulen=5 "alice", plen=6 "s3cret"
        app.write_all(&[0x01, 0x05]).await.unwrap();
        app.write_all(b"alice").await.unwrap();
        app.write_all(&[0x06]).await.unwrap();
        app.write_all(b"s3cret").await.unwrap();

        let v = verifier("alice", "s3cret");
        negotiate(&mut proxy, Some(&v)).await.unwrap();

        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x02, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_password_failure() {
        let (mut app, mut proxy) = duplex(256);
        app.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        app.write_all(&[0x01, 0x05]).await.unwrap();
        app.write_all(b"alice").await.unwrap();
        app.write_all(&[0x05]).await.unwrap();
        app.write_all(b"wrong").await.unwrap();

        let v = verifier("alice", "s3cret");
        let err = negotiate(&mut proxy, Some(&v)).await.unwrap_err();
        assert!(err.is_auth_failure());

        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x02, 0x01, 0x01]);
    }
}
