//! Client side of the SOCKS5 handshake, spoken toward the upstream server
//! through the wrapped transport.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::socks::{
    Reply, Request, AUTH_VERSION, METHOD_NONE, METHOD_NO_ACCEPTABLE, METHOD_PASSWORD, VERSION,
};

/// Greet the upstream server and authenticate if it asks for credentials.
///
/// Method 0x02 is offered only when credentials are configured; a server
/// selecting it without credentials on hand is an authentication failure.
pub async fn handshake<S>(stream: &mut S, credentials: Option<(&str, &str)>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match credentials {
        Some(_) => {
            stream
                .write_all(&[VERSION, 0x02, METHOD_NONE, METHOD_PASSWORD])
                .await?
        }
        None => stream.write_all(&[VERSION, 0x01, METHOD_NONE]).await?,
    }
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(Error::protocol(format!(
            "bad method selection version: 0x{:02x}",
            choice[0]
        )));
    }

    match choice[1] {
        METHOD_NONE => Ok(()),
        METHOD_PASSWORD => {
            let (username, password) = credentials.ok_or(Error::Auth)?;
            subnegotiate(stream, username, password).await
        }
        METHOD_NO_ACCEPTABLE => Err(Error::Auth),
        other => Err(Error::protocol(format!(
            "server selected unknown method: 0x{:02x}",
            other
        ))),
    }
}

async fn subnegotiate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::protocol("credentials exceed 255 bytes"));
    }

    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(AUTH_VERSION);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(Error::Auth);
    }
    Ok(())
}

/// Forward a request to the upstream server and read its reply.
pub async fn request<S>(stream: &mut S, req: &Request) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    req.write_to(stream).await?;
    Reply::read_from(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::{Address, ReplyCode};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_without_credentials() {
        let (mut upstream, mut local) = duplex(256);

        let task = tokio::spawn(async move {
            handshake(&mut local, None).await.unwrap();
            local
        });

        let mut greeting = [0u8; 3];
        upstream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        upstream.write_all(&[0x05, 0x00]).await.unwrap();

        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_with_credentials() {
        let (mut upstream, mut local) = duplex(256);

        let task = tokio::spawn(async move {
            handshake(&mut local, Some(("alice", "s3cret"))).await.unwrap();
            local
        });

        let mut greeting = [0u8; 4];
        upstream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
        upstream.write_all(&[0x05, 0x02]).await.unwrap();

        let mut auth = [0u8; 14];
        upstream.read_exact(&mut auth).await.unwrap();
        assert_eq!(auth[0], 0x01);
        assert_eq!(&auth[2..7], b"alice");
        upstream.write_all(&[0x01, 0x00]).await.unwrap();

        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_auth_rejected() {
        let (mut upstream, mut local) = duplex(256);

        let task = tokio::spawn(async move { handshake(&mut local, None).await });

        let mut greeting = [0u8; 3];
        upstream.read_exact(&mut greeting).await.unwrap();
        upstream.write_all(&[0x05, 0xff]).await.unwrap();

        assert!(task.await.unwrap().unwrap_err().is_auth_failure());
    }

    #[tokio::test]
    async fn test_request_reply_exchange() {
        let (mut upstream, mut local) = duplex(256);
        let req = Request::connect(Address::Domain("example.com".into(), 80));

        let task = tokio::spawn(async move { request(&mut local, &req).await });

        let mut head = [0u8; 4];
        upstream.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [0x05, 0x01, 0x00, 0x03]);
        let mut rest = [0u8; 14];
        upstream.read_exact(&mut rest).await.unwrap();

        upstream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();

        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply.code, ReplyCode::Succeeded);
        assert_eq!(reply.bind, "10.0.0.1:8080".parse().unwrap());
    }
}
