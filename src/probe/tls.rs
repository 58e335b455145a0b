//! TLS connectors and the certificate-expiry side-check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::*;

use super::{connect_tcp, ProbeError};

const SECS_PER_DAY: i64 = 86_400;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Connector that validates the chain against the webpki roots.
pub fn verified_connector() -> Result<TlsConnector, ProbeError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Connector that accepts any chain, so expired or self-signed
/// certificates can still be read.
pub fn inspecting_connector() -> Result<TlsConnector, ProbeError> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run a client handshake over `stream` with SNI set to `host`.
pub async fn tls_handshake(
    connector: &TlsConnector,
    host: &str,
    stream: TcpStream,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, ProbeError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::Config(format!("invalid server name {:?}: {}", host, e)))?;
    tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Tls(e.to_string()))
}

/// Signatures are still checked; only chain trust and validity dates are skipped.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Expiry of a peer's leaf certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateInfo {
    pub not_after: DateTime<Utc>,
    pub days_until_expiry: i64,
}

/// Whole days from `now` until `not_after`, rounded down. Negative once expired.
pub fn days_until(not_after: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (not_after - now).num_seconds().div_euclid(SECS_PER_DAY)
}

/// Reads peer certificates.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn inspect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<CertificateInfo, ProbeError>;
}

/// Fetches the leaf certificate with a live TLS handshake.
pub struct TlsInspector {
    connector: TlsConnector,
}

impl TlsInspector {
    pub fn new() -> Result<Self, ProbeError> {
        Ok(Self {
            connector: inspecting_connector()?,
        })
    }
}

#[async_trait]
impl CertificateSource for TlsInspector {
    async fn inspect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<CertificateInfo, ProbeError> {
        let tcp = connect_tcp(host, port, timeout).await?;
        let tls = tls_handshake(&self.connector, host, tcp, timeout).await?;

        let (_io, conn) = tls.get_ref();
        let leaf = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| ProbeError::Tls("no peer certificate".to_string()))?;

        let (_, cert) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| ProbeError::Tls(format!("failed to parse certificate: {}", e)))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| ProbeError::Tls("certificate expiry out of range".to_string()))?;

        Ok(CertificateInfo {
            not_after,
            days_until_expiry: days_until(not_after, Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tokio::net::TcpListener;

    #[test]
    fn test_days_until_rounds_down() {
        let now = Utc::now();
        assert_eq!(days_until(now + ChronoDuration::hours(47), now), 1);
        assert_eq!(days_until(now + ChronoDuration::days(30), now), 30);
        assert_eq!(days_until(now + ChronoDuration::days(30) - ChronoDuration::seconds(1), now), 29);
        assert_eq!(days_until(now - ChronoDuration::hours(1), now), -1);
    }

    #[test]
    fn test_connectors_build() {
        assert!(verified_connector().is_ok());
        assert!(inspecting_connector().is_ok());
    }

    #[tokio::test]
    async fn test_inspect_refused_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let inspector = TlsInspector::new().unwrap();
        let err = inspector
            .inspect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Refused(_)));
    }

    #[tokio::test]
    async fn test_inspect_plaintext_server_is_tls_error() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        });

        let inspector = TlsInspector::new().unwrap();
        let err = inspector
            .inspect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Tls(_)));
    }
}
