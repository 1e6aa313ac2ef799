//! Client configuration.

use std::time::Duration;

use linkup_settings::ClientSettings;
use linkup_transport::{Certificate, ConnectOptions};

/// Runtime parameters for a [`ClientConnection`](crate::ClientConnection).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Bound on transport setup plus the server's `Connected` acknowledgement.
    pub connect_timeout: Duration,
    /// Bound on sign-in, restore, sign-out and disconnect round trips.
    pub request_timeout: Duration,
    /// Long-poll idle time after an empty poll.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ClientConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }
}

impl ClientConfig {
    pub(crate) fn connect_options(&self, certificate: Option<Certificate>) -> ConnectOptions {
        ConnectOptions {
            certificate,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            poll_interval: self.poll_interval,
        }
    }
}
