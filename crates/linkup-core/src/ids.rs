//! Identity and identifier newtypes.
//!
//! - [`Id`]: routing identity `username@domain`, lower-cased on construction
//! - [`Token`]: opaque, unguessable session token
//! - [`ConnectionId`]: per-connection handle (UUID v7, time-ordered)

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::IdError;

/// Domain assigned to ids parsed without an `@`.
pub const ANONYMOUS_DOMAIN: &str = "anonymous";

// ─────────────────────────────────────────────────────────────────────────────
// Id
// ─────────────────────────────────────────────────────────────────────────────

/// A routing identity of the form `username@domain`.
///
/// Both parts are stored lower-case, so derived equality and hashing are
/// case-insensitive with respect to the original input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Id {
    username: String,
    domain: String,
}

impl Id {
    /// Build an id from its parts.
    pub fn new(username: &str, domain: &str) -> Result<Self, IdError> {
        let username = username.trim();
        let domain = domain.trim();
        if username.is_empty() {
            return Err(IdError::EmptyUsername);
        }
        if domain.is_empty() {
            return Err(IdError::EmptyDomain);
        }
        if username.contains('@') || domain.contains('@') {
            return Err(IdError::TooManySeparators(format!("{username}@{domain}")));
        }
        Ok(Self {
            username: username.to_lowercase(),
            domain: domain.to_lowercase(),
        })
    }

    /// Username part (lower-case).
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Domain part (lower-case).
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('@') {
            Some((username, domain)) => {
                if domain.contains('@') {
                    return Err(IdError::TooManySeparators(s.to_owned()));
                }
                Self::new(username, domain)
            }
            None => Self::new(s, ANONYMOUS_DOMAIN),
        }
    }
}

impl TryFrom<String> for Id {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.to_string()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.domain)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token
// ─────────────────────────────────────────────────────────────────────────────

/// Number of random bytes behind a freshly minted token.
const TOKEN_BYTES: usize = 32;

/// Opaque session token.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Mint a new random token.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Wrap an existing token value (e.g. one received from a peer).
    #[must_use]
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "Token({prefix}…)")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionId
// ─────────────────────────────────────────────────────────────────────────────

/// Unique handle for one live connection (UUID v7).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
