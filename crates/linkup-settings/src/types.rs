//! Settings schema.
//!
//! Every struct uses `camelCase` keys and fills missing fields from its
//! `Default` impl, so a partial user file is always valid.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkupSettings {
    /// Server listeners and timeouts.
    pub server: ServerSettings,
    /// Client timeouts and polling.
    pub client: ClientSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Server listeners and directory timeouts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Listener endpoints (`tcp://`, `ssl://`, `ws://`, `wss://`, `http://`, `https://`).
    pub endpoints: Vec<String>,
    /// PEM certificate for TLS endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<String>,
    /// PEM private key matching `certificate_path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    /// Domains accepted by the daemon's authenticator (empty accepts all).
    pub allowed_domains: Vec<String>,
    /// Disconnect connections that have not signed in after this long (0 disables).
    pub authentication_timeout_ms: u64,
    /// Expire sessions left without a connection after this long (0 disables).
    pub session_timeout_ms: u64,
    /// Close idle long-poll channels after this long.
    pub long_poll_inactivity_ms: u64,
    /// Capacity of the server event broadcast channel.
    pub event_capacity: usize,
    /// Prometheus exporter port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            endpoints: vec!["tcp://127.0.0.1:5650/".to_string()],
            certificate_path: None,
            private_key_path: None,
            allowed_domains: Vec::new(),
            authentication_timeout_ms: 30_000,
            session_timeout_ms: 300_000,
            long_poll_inactivity_ms: 5_000,
            event_capacity: 256,
            metrics_port: None,
        }
    }
}

/// Client-side timeouts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// How long `connect` waits for the server's acknowledgement.
    pub connect_timeout_ms: u64,
    /// How long sign-in, restore and sign-out wait for a reply.
    pub request_timeout_ms: u64,
    /// Long-poll interval after an empty poll.
    pub poll_interval_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            poll_interval_ms: 500,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = LinkupSettings::default();
        assert_eq!(settings.server.endpoints, vec!["tcp://127.0.0.1:5650/"]);
        assert_eq!(settings.server.long_poll_inactivity_ms, 5_000);
        assert_eq!(settings.client.poll_interval_ms, 500);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(LinkupSettings::default()).unwrap();
        assert!(json["server"]["authenticationTimeoutMs"].is_u64());
        assert!(json["client"]["requestTimeoutMs"].is_u64());
        assert!(json["server"].get("metricsPort").is_none());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let settings: LinkupSettings =
            serde_json::from_str(r#"{"server": {"sessionTimeoutMs": 0}}"#).unwrap();
        assert_eq!(settings.server.session_timeout_ms, 0);
        assert_eq!(settings.server.authentication_timeout_ms, 30_000);
        assert_eq!(settings.client, ClientSettings::default());
    }
}
