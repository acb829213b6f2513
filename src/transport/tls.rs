//! TLS layer shared by the `tls`, `https` and `wss` carriers.
//!
//! The client has three verification modes: a domain server name is checked
//! the standard way against the configured CA bundle (or the system store);
//! a bare IP server address gets chain-only verification that ignores the
//! absent name; and `skip_verify` disables verification entirely and wins
//! over both, even when a CA bundle is configured.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};
use crate::transport::Stream;

/// Client-side TLS wrapper bound to one upstream server.
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClient {
    pub fn new(server_host: &str, ca: Option<&Path>, skip_verify: bool) -> Result<Self> {
        let server_name = ServerName::try_from(server_host.to_string())
            .map_err(|_| Error::tls(format!("invalid server name {:?}", server_host)))?;

        let config = if skip_verify {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification))
                .with_no_client_auth()
        } else if server_host.parse::<IpAddr>().is_ok() {
            // The server is addressed by IP; certificates rarely carry one,
            // so only the chain is checked. The IP itself is the identifier.
            let verifier = WebPkiServerVerifier::builder(Arc::new(load_roots(ca)?))
                .build()
                .map_err(|e| Error::tls(e.to_string()))?;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ChainOnlyVerification { inner: verifier }))
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .with_root_certificates(load_roots(ca)?)
                .with_no_client_auth()
        };

        Ok(TlsClient {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Run the TLS handshake over an established stream.
    pub async fn connect<S>(&self, stream: S) -> Result<tokio_rustls::client::TlsStream<S>>
    where
        S: Stream,
    {
        let stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await?;
        Ok(stream)
    }
}

/// Build a server-side acceptor from PEM certificate and key files.
pub fn acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert)?;

    let key_file = File::open(key)
        .map_err(|e| Error::config(format!("cannot open key file {}: {}", key.display(), e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::config(format!("cannot parse key file {}: {}", key.display(), e)))?
        .ok_or_else(|| Error::config(format!("no private key in {}", key.display())))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("cannot open cert file {}: {}", path.display(), e)))?;
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs =
        certs.map_err(|e| Error::config(format!("bad certificate in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Root store from the configured CA bundle, or the system store when no
/// bundle is given.
fn load_roots(ca: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::config(format!("bad CA certificate: {}", e)))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs()
                .map_err(|e| Error::config(format!("cannot load system CA certificates: {}", e)))?;
            let (added, skipped) = roots.add_parsable_certificates(native);
            if added == 0 {
                return Err(Error::config("no usable system CA certificates"));
            }
            if skipped > 0 {
                tracing::debug!("skipped {} unparsable system CA certificates", skipped);
            }
        }
    }
    Ok(roots)
}

static ALL_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::RSA_PKCS1_SHA1,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA512,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ECDSA_NISTP521_SHA512,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA512,
    SignatureScheme::ED25519,
];

/// Verifier for `skip_verify`: accepts any presented certificate.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ALL_SCHEMES.to_vec()
    }
}

/// Verifier for IP-addressed servers: full chain verification, but a
/// name mismatch is not an error because there is no name to match.
#[derive(Debug)]
struct ChainOnlyVerification {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnlyVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_verify_builds_without_roots() {
        // skip_verify wins even when no CA is reachable.
        assert!(TlsClient::new("example.com", None, true).is_ok());
        assert!(TlsClient::new("192.0.2.7", None, true).is_ok());
    }

    #[test]
    fn test_invalid_server_name_rejected() {
        assert!(TlsClient::new("bad name with spaces", None, true).is_err());
    }

    #[test]
    fn test_acceptor_requires_existing_files() {
        let err = match acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem")) {
            Ok(_) => panic!("expected error"),
            Err(err) => err,
        };
        assert!(err.is_config());
    }
}
