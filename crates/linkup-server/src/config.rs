//! Server configuration.

use std::time::Duration;

use linkup_settings::ServerSettings;

/// Runtime parameters for a [`Server`](crate::Server).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Anonymous connections are dropped after this long. `None` disables.
    pub authentication_timeout: Option<Duration>,
    /// Orphaned sessions are forgotten after this long. `None` keeps them.
    pub session_timeout: Option<Duration>,
    /// How often the orphan sweeper runs.
    pub sweep_interval: Duration,
    /// Long-poll server channel inactivity window.
    pub long_poll_inactivity: Duration,
    /// Capacity of the [`ServerEvent`](crate::ServerEvent) broadcast.
    pub event_capacity: usize,
    /// Bound on waiting for connection tasks during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            authentication_timeout: optional_millis(settings.authentication_timeout_ms),
            session_timeout: optional_millis(settings.session_timeout_ms),
            sweep_interval: Duration::from_secs(1),
            long_poll_inactivity: Duration::from_millis(settings.long_poll_inactivity_ms),
            event_capacity: settings.event_capacity.max(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}
