//! TLS dialer for production links.

use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tgate_core::transport::{BoxedLinkStream, LinkDialer};
use tgate_core::{GateError, GateResult};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Dials a broker endpoint over TLS, verifying against a configured CA.
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    /// Build a dialer trusting only the CA certificates in the given PEM file.
    pub fn from_ca_file(path: &Path) -> GateResult<Self> {
        let pem = std::fs::read(path).map_err(|e| {
            GateError::Config(format!("cannot read CA file {}: {e}", path.display()))
        })?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            let cert = cert.map_err(|e| {
                GateError::Config(format!("bad certificate in {}: {e}", path.display()))
            })?;
            roots.add(cert).map_err(|e| {
                GateError::Config(format!("rejected certificate in {}: {e}", path.display()))
            })?;
        }
        if roots.is_empty() {
            return Err(GateError::Config(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Dialer with an empty trust store, for configurations with no hops.
    /// Any actual dial attempt fails certificate validation.
    pub fn without_roots() -> Self {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl LinkDialer for TlsDialer {
    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> Pin<Box<dyn std::future::Future<Output = GateResult<BoxedLinkStream>> + Send + 'a>> {
        Box::pin(async move {
            let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| GateError::Network(format!("connect to {host}:{port} timed out")))?
                .map_err(|e| GateError::Network(format!("connect to {host}:{port}: {e}")))?;

            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| GateError::Config(format!("invalid server name {host:?}")))?;

            let tls = tokio::time::timeout(timeout, self.connector.connect(server_name, tcp))
                .await
                .map_err(|_| {
                    GateError::Network(format!("TLS handshake with {host}:{port} timed out"))
                })?
                .map_err(|e| GateError::Network(format!("TLS handshake with {host}:{port}: {e}")))?;

            Ok(Box::new(tls) as BoxedLinkStream)
        })
    }
}
