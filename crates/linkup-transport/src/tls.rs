//! Certificates and rustls configuration.
//!
//! A [`Certificate`] is PEM material plus, on the listening side, its
//! private key. Clients pin the supplied certificate: it is the only trust
//! root their TLS configuration accepts.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

use crate::errors::{Result, TransportError};

/// Upper bound on a server-side TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// PEM certificate chain with an optional private key.
#[derive(Clone)]
pub struct Certificate {
    cert_pem: String,
    key_pem: Option<String>,
}

impl Certificate {
    /// Wrap PEM text, validating that it parses.
    pub fn from_pem(cert_pem: impl Into<String>, key_pem: Option<String>) -> Result<Self> {
        let certificate = Self {
            cert_pem: cert_pem.into(),
            key_pem,
        };
        let _ = certificate.cert_chain()?;
        if certificate.key_pem.is_some() {
            let _ = certificate.private_key()?;
        }
        Ok(certificate)
    }

    /// Read PEM files from disk.
    pub fn load(cert_path: &Path, key_path: Option<&Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = key_path.map(std::fs::read_to_string).transpose()?;
        Self::from_pem(cert_pem, key_pem)
    }

    /// Generate a self-signed certificate (with key) for `names`.
    pub fn self_signed(names: &[&str]) -> Result<Self> {
        let names: Vec<String> = names.iter().map(|n| (*n).to_owned()).collect();
        let generated = rcgen::generate_simple_self_signed(names)
            .map_err(|e| TransportError::Certificate(e.to_string()))?;
        Ok(Self {
            cert_pem: generated.cert.pem(),
            key_pem: Some(generated.key_pair.serialize_pem()),
        })
    }

    /// Copy without the private key, for handing to clients.
    #[must_use]
    pub fn public(&self) -> Self {
        Self {
            cert_pem: self.cert_pem.clone(),
            key_pem: None,
        }
    }

    /// Certificate chain PEM.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Whether the private key is present.
    pub fn has_private_key(&self) -> bool {
        self.key_pem.is_some()
    }

    fn cert_chain(&self) -> Result<Vec<CertificateDer<'static>>> {
        let chain = CertificateDer::pem_slice_iter(self.cert_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TransportError::Certificate(e.to_string()))?;
        if chain.is_empty() {
            return Err(TransportError::Certificate("no certificate in PEM".into()));
        }
        Ok(chain)
    }

    fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
        let pem = self.key_pem.as_ref().ok_or(TransportError::PrivateKeyRequired)?;
        PrivateKeyDer::from_pem_slice(pem.as_bytes())
            .map_err(|e| TransportError::Certificate(e.to_string()))
    }

    /// Listener-side TLS configuration.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain()?, self.private_key()?)?;
        Ok(Arc::new(config))
    }

    /// Client-side TLS configuration trusting only this certificate.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        for cert in self.cert_chain()? {
            roots.add(cert)?;
        }
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("has_private_key", &self.key_pem.is_some())
            .finish()
    }
}

/// TCP listener that completes TLS handshakes before yielding streams.
///
/// Plugs into `axum::serve` for the `https` and `wss` listeners. Handshakes
/// run concurrently, so a peer that never sends its hello holds up nobody
/// but itself. Failed or stalled handshakes are logged and skipped.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    handshakes: JoinSet<Option<(TlsStream<TcpStream>, SocketAddr)>>,
}

impl TlsListener {
    /// Wrap a bound listener.
    pub fn new(inner: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self {
            inner,
            acceptor,
            handshakes: JoinSet::new(),
        }
    }
}

async fn server_handshake(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    addr: SocketAddr,
) -> Option<(TlsStream<TcpStream>, SocketAddr)> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => Some((stream, addr)),
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "tls handshake failed");
            None
        }
        Err(_) => {
            debug!(%addr, "tls handshake timed out");
            None
        }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            tokio::select! {
                Some(joined) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {
                    if let Ok(Some(done)) = joined {
                        return done;
                    }
                }
                result = self.inner.accept() => match result {
                    Ok((tcp, addr)) => {
                        let acceptor = self.acceptor.clone();
                        let _ = self.handshakes.spawn(server_handshake(acceptor, tcp, addr));
                    }
                    Err(e) => {
                        warn!(error = %e, "tls listener accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn self_signed_builds_both_configs() {
        let cert = Certificate::self_signed(&["localhost"]).unwrap();
        assert!(cert.has_private_key());
        assert!(cert.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(cert.server_config().is_ok());
        assert!(cert.client_config().is_ok());
    }

    #[test]
    fn public_copy_cannot_serve() {
        let cert = Certificate::self_signed(&["localhost"]).unwrap().public();
        assert!(!cert.has_private_key());
        assert_matches!(cert.server_config(), Err(TransportError::PrivateKeyRequired));
        assert!(cert.client_config().is_ok());
    }

    #[test]
    fn from_pem_validates() {
        assert_matches!(
            Certificate::from_pem("garbage", None),
            Err(TransportError::Certificate(_))
        );
        let generated = Certificate::self_signed(&["localhost"]).unwrap();
        let reparsed = Certificate::from_pem(generated.cert_pem(), None).unwrap();
        assert_eq!(reparsed.cert_pem(), generated.cert_pem());
    }

    #[test]
    fn debug_hides_key_material() {
        let cert = Certificate::self_signed(&["localhost"]).unwrap();
        let debug = format!("{cert:?}");
        assert!(!debug.contains("PRIVATE KEY"));
        assert!(debug.contains("has_private_key: true"));
    }
}
