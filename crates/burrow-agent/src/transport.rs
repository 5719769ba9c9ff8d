//! Outbound connection to the proxy
//!
//! A fresh [`TunnelIo`] is built for every connection attempt: plain TCP, or
//! TCP wrapped in TLS when the configuration asks for it.

use crate::config::{AgentConfig, TlsMode};
use rustls::pki_types::{CertificateDer, ServerName};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Connecting to {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake with {address} failed: {source}")]
    TlsHandshake {
        address: String,
        source: std::io::Error,
    },
}

/// Byte stream to the proxy, plain or encrypted
///
/// Must be `Sync`: the session future holds `&` borrows of the read half
/// across awaits and is still spawned.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

pub type BoxedIo = Box<dyn TunnelIo>;

/// Builds proxy connections from the agent configuration
#[derive(Clone)]
pub struct Connector {
    address: String,
    timeout: Duration,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Connector {
    pub fn new(config: &AgentConfig) -> Result<Self, TransportError> {
        let tls = match &config.tls {
            TlsMode::Disabled => None,
            TlsMode::Enabled {
                insecure,
                ca_file,
                server_name,
            } => {
                let connector = if *insecure {
                    warn!("Certificate verification disabled (insecure mode)");
                    build_insecure_tls_connector()
                } else {
                    build_tls_connector(ca_file.as_deref())?
                };

                let name = server_name
                    .clone()
                    .unwrap_or_else(|| config.proxy_host.clone());
                let name = ServerName::try_from(name.clone())
                    .map_err(|_| TransportError::InvalidServerName(name))?;

                Some((connector, name))
            }
        };

        Ok(Self {
            address: config.proxy_addr(),
            timeout: config.proxy_connect_timeout,
            tls,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Open a new connection to the proxy
    pub async fn connect(&self) -> Result<BoxedIo, TransportError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TransportError::Timeout(self.address.clone(), self.timeout))?
            .map_err(|source| TransportError::ConnectionFailed {
                address: self.address.clone(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on proxy connection");
        }

        let Some((connector, server_name)) = &self.tls else {
            return Ok(Box::new(stream));
        };

        let tls_stream = tokio::time::timeout(
            self.timeout,
            connector.connect(server_name.clone(), stream),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.address.clone(), self.timeout))?
        .map_err(|source| TransportError::TlsHandshake {
            address: self.address.clone(),
            source,
        })?;

        debug!(address = %self.address, "TLS established with proxy");
        Ok(Box::new(tls_stream))
    }
}

// Helper functions for TLS

fn build_tls_connector(ca_file: Option<&Path>) -> Result<TlsConnector, TransportError> {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_file {
        for cert in load_ca_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| TransportError::TlsConfig(format!("{}: {}", path.display(), e)))?;
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

fn build_insecure_tls_connector() -> TlsConnector {
    ensure_crypto_provider();

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipVerification::new())
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

fn load_ca_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsConfig(format!("{}: {}", path.display(), e)))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsConfig(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsConfig(format!(
            "{}: no certificates found",
            path.display()
        )));
    }

    Ok(certs)
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // Err means a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

// Insecure TLS verifier for development
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(port: u16, tls: TlsMode) -> AgentConfig {
        AgentConfig::builder()
            .proxy("127.0.0.1", port)
            .device_name("dev")
            .device_token("token")
            .tls(tls)
            .proxy_connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_plain_tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = Connector::new(&config(port, TlsMode::Disabled)).unwrap();
        let mut io = connector.connect().await.unwrap();
        io.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let connector = Connector::new(&config(port, TlsMode::Disabled)).unwrap();
        let result = connector.connect().await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed { .. })
        ));
    }

    #[test]
    fn test_missing_ca_file() {
        let tls = TlsMode::Enabled {
            insecure: false,
            ca_file: Some("/nonexistent/burrow-ca.pem".into()),
            server_name: None,
        };

        let result = Connector::new(&config(7000, tls));
        assert!(matches!(result, Err(TransportError::TlsConfig(_))));
    }

    #[test]
    fn test_tls_connector_uses_proxy_host_as_server_name() {
        let tls = TlsMode::Enabled {
            insecure: true,
            ca_file: None,
            server_name: None,
        };

        let connector = Connector::new(&config(7000, tls)).unwrap();
        let (_, name) = connector.tls.as_ref().unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }
}
