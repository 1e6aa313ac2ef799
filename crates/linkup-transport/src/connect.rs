//! Endpoint-driven construction of client channels and listeners.

use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::Connector;
use tracing::debug;

use crate::channel::{Channel, ChannelListener};
use crate::endpoint::{Endpoint, Scheme};
use crate::errors::{Result, TransportError};
use crate::longpoll::{DEFAULT_INACTIVITY, LongPollChannelListener, LongPollClientChannel};
use crate::stream::{StreamChannel, StreamChannelListener};
use crate::tls::Certificate;
use crate::websocket::{WebSocketChannel, WebSocketChannelListener};

/// Client-side connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Pinned server certificate; required for `ssl`, `https` and `wss`.
    pub certificate: Option<Certificate>,
    /// Bound on establishing the transport.
    pub connect_timeout: Duration,
    /// Bound on each long-poll HTTP request.
    pub request_timeout: Duration,
    /// Long-poll idle time after an empty poll.
    pub poll_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            certificate: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl ConnectOptions {
    /// Set the pinned certificate.
    #[must_use]
    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    fn certificate_for(&self, scheme: Scheme) -> Result<&Certificate> {
        self.certificate
            .as_ref()
            .ok_or(TransportError::CertificateRequired(scheme))
    }
}

/// Listener-side parameters.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Long-poll server channel inactivity window.
    pub long_poll_inactivity: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            long_poll_inactivity: DEFAULT_INACTIVITY,
        }
    }
}

async fn connect_tcp(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint.authority()))
        .await
        .map_err(|_| TransportError::Timeout(endpoint.to_string()))??;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Establish the transport for `endpoint`. The returned channel is not yet
/// open.
pub async fn connect(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Arc<dyn Channel>> {
    let peer = endpoint.to_string();
    debug!(%endpoint, "connecting");
    let channel: Arc<dyn Channel> = match endpoint.scheme() {
        Scheme::Tcp => {
            let stream = connect_tcp(endpoint, options.connect_timeout).await?;
            Arc::new(StreamChannel::new(stream, peer))
        }
        Scheme::Ssl => {
            let certificate = options.certificate_for(Scheme::Ssl)?;
            let connector = TlsConnector::from(certificate.client_config()?);
            let name = ServerName::try_from(endpoint.server_name().to_owned())
                .map_err(|e| TransportError::Certificate(e.to_string()))?;
            let stream = connect_tcp(endpoint, options.connect_timeout).await?;
            let tls = tokio::time::timeout(options.connect_timeout, connector.connect(name, stream))
                .await
                .map_err(|_| TransportError::Timeout(peer.clone()))??;
            Arc::new(StreamChannel::new(tls, peer))
        }
        Scheme::Ws | Scheme::Wss => {
            let connector = match endpoint.scheme() {
                Scheme::Wss => Some(Connector::Rustls(
                    options.certificate_for(Scheme::Wss)?.client_config()?,
                )),
                _ => None,
            };
            let handshake = tokio_tungstenite::connect_async_tls_with_config(
                peer.clone(),
                None,
                true,
                connector,
            );
            let (socket, _response) = tokio::time::timeout(options.connect_timeout, handshake)
                .await
                .map_err(|_| TransportError::Timeout(peer.clone()))??;
            Arc::new(WebSocketChannel::from_tungstenite(socket, peer))
        }
        Scheme::Http | Scheme::Https => {
            let mut builder = reqwest::Client::builder()
                .connect_timeout(options.connect_timeout)
                .timeout(options.request_timeout);
            if endpoint.scheme() == Scheme::Https {
                let certificate = options.certificate_for(Scheme::Https)?;
                builder = builder
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(reqwest::Certificate::from_pem(
                        certificate.cert_pem().as_bytes(),
                    )?);
            }
            Arc::new(LongPollClientChannel::new(
                peer,
                builder.build()?,
                options.poll_interval,
            ))
        }
    };
    Ok(channel)
}

/// Build the listener for `endpoint`. TLS schemes need a certificate with
/// its private key.
pub fn listener_for(
    endpoint: &Endpoint,
    certificate: Option<&Certificate>,
    options: &ListenerOptions,
) -> Result<Arc<dyn ChannelListener>> {
    let scheme = endpoint.scheme();
    let tls = if scheme.uses_tls() {
        let certificate = certificate.ok_or(TransportError::CertificateRequired(scheme))?;
        Some(TlsAcceptor::from(certificate.server_config()?))
    } else {
        None
    };
    let endpoint = endpoint.clone();
    let listener: Arc<dyn ChannelListener> = match scheme {
        Scheme::Tcp | Scheme::Ssl => Arc::new(StreamChannelListener::new(endpoint, tls)),
        Scheme::Ws | Scheme::Wss => Arc::new(WebSocketChannelListener::new(endpoint, tls)),
        Scheme::Http | Scheme::Https => Arc::new(LongPollChannelListener::new(
            endpoint,
            tls,
            options.long_poll_inactivity,
        )),
    };
    Ok(listener)
}
