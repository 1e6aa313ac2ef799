//! Endpoint addressing: `scheme://host:port/path`.
//!
//! | scheme | transport | certificate |
//! |---|---|---|
//! | `tcp` | stream socket | no |
//! | `ssl` | TLS stream socket | yes |
//! | `http` | long-poll | no |
//! | `https` | long-poll over TLS | yes |
//! | `ws` | WebSocket | no |
//! | `wss` | WebSocket over TLS | yes |

use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use crate::errors::TransportError;

/// Transport selected by an endpoint's scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Raw TCP stream.
    Tcp,
    /// TLS over TCP.
    Ssl,
    /// HTTP long-poll.
    Http,
    /// HTTPS long-poll.
    Https,
    /// WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl Scheme {
    /// Parse a scheme name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "ssl" => Some(Self::Ssl),
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    /// Lower-case scheme name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ssl => "ssl",
            Self::Http => "http",
            Self::Https => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    /// Whether the transport runs over TLS and needs a certificate.
    pub fn uses_tls(self) -> bool {
        matches!(self, Self::Ssl | Self::Https | Self::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    /// Transport scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host as written (IPv6 addresses keep their brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host suitable for TLS server-name checks.
    pub fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, for socket connect/bind.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Copy of this endpoint with a different port.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // `+` and `*` bind every interface.
        let normalized = s.trim().replacen("://+", "://0.0.0.0", 1).replacen("://*", "://0.0.0.0", 1);
        let url = Url::parse(&normalized).map_err(|_| TransportError::InvalidEndpoint(s.to_owned()))?;
        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| TransportError::UnsupportedScheme(url.scheme().to_owned()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidEndpoint(s.to_owned()))?
            .to_owned();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::MissingPort(s.to_owned()))?;
        let path = if url.path().is_empty() {
            "/".to_owned()
        } else {
            url.path().to_owned()
        };
        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_every_scheme() {
        for (text, scheme) in [
            ("tcp://localhost:5650/", Scheme::Tcp),
            ("ssl://localhost:5651/", Scheme::Ssl),
            ("http://localhost:5652/", Scheme::Http),
            ("https://localhost:5653/", Scheme::Https),
            ("ws://localhost:5654/", Scheme::Ws),
            ("wss://localhost:5655/", Scheme::Wss),
        ] {
            let endpoint: Endpoint = text.parse().unwrap();
            assert_eq!(endpoint.scheme(), scheme);
            assert_eq!(endpoint.host(), "localhost");
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn tls_schemes() {
        assert!(Scheme::Ssl.uses_tls());
        assert!(Scheme::Https.uses_tls());
        assert!(Scheme::Wss.uses_tls());
        assert!(!Scheme::Tcp.uses_tls());
        assert!(!Scheme::Http.uses_tls());
        assert!(!Scheme::Ws.uses_tls());
    }

    #[test]
    fn path_and_defaults() {
        let endpoint: Endpoint = "tcp://127.0.0.1:9000".parse().unwrap();
        assert_eq!(endpoint.path(), "/");
        assert_eq!(endpoint.authority(), "127.0.0.1:9000");

        let endpoint: Endpoint = "ws://example.com/linkup".parse().unwrap();
        assert_eq!(endpoint.port(), 80);
        assert_eq!(endpoint.path(), "/linkup");
    }

    #[test]
    fn wildcard_host() {
        let endpoint: Endpoint = "tcp://+:5650/".parse().unwrap();
        assert_eq!(endpoint.host(), "0.0.0.0");
    }

    #[test]
    fn rejects_bad_input() {
        assert_matches!("ftp://host:1/".parse::<Endpoint>(), Err(TransportError::UnsupportedScheme(s)) if s == "ftp");
        assert_matches!("tcp://host/".parse::<Endpoint>(), Err(TransportError::MissingPort(_)));
        assert_matches!("not an endpoint".parse::<Endpoint>(), Err(TransportError::InvalidEndpoint(_)));
    }

    #[test]
    fn with_port_keeps_the_rest() {
        let endpoint: Endpoint = "ws://127.0.0.1:0/chat".parse().unwrap();
        assert_eq!(endpoint.with_port(4000).to_string(), "ws://127.0.0.1:4000/chat");
    }
}
