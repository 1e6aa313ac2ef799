//! Transport error types.

use thiserror::Error;

use crate::endpoint::Scheme;

/// Convenience result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failure to set up or open a channel or listener.
///
/// Steady-state read/write failures never surface here; they close the
/// channel instead.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint string could not be parsed.
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),

    /// Endpoint scheme is not one of the supported transports.
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),

    /// Stream endpoints must name a port.
    #[error("endpoint `{0}` has no port")]
    MissingPort(String),

    /// TLS scheme used without a certificate.
    #[error("{0} endpoints require a certificate")]
    CertificateRequired(Scheme),

    /// Listener certificate lacks its private key.
    #[error("certificate has no private key")]
    PrivateKeyRequired,

    /// Certificate or key material could not be parsed or generated.
    #[error("certificate: {0}")]
    Certificate(String),

    /// TLS configuration or handshake failure.
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    /// Socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket handshake failure.
    #[error("websocket: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// HTTP client failure.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// A long-poll request got an unexpected status.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    /// Connecting took too long.
    #[error("connecting to {0} timed out")]
    Timeout(String),

    /// `open` was called twice on the same channel.
    #[error("channel already opened")]
    AlreadyOpen,

    /// `start` was called on a running listener.
    #[error("listener already started")]
    AlreadyStarted,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            TransportError::CertificateRequired(Scheme::Wss).to_string(),
            "wss endpoints require a certificate"
        );
        assert_eq!(TransportError::HttpStatus(500).to_string(), "unexpected http status 500");
        assert_eq!(
            TransportError::MissingPort("tcp://host".into()).to_string(),
            "endpoint `tcp://host` has no port"
        );
    }
}
