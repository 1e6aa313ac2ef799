//! Authenticated identity plus opaque token.

use serde::{Deserialize, Serialize};

use crate::ids::{Id, Token};

/// The unit of sign-in and restore.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Identity the session authenticates.
    pub id: Id,
    /// Token presented on restore.
    pub token: Token,
}

impl Session {
    /// Mint a new session for `id` with a fresh token.
    #[must_use]
    pub fn new(id: Id) -> Self {
        Self {
            id,
            token: Token::generate(),
        }
    }

    /// Rebuild a session from an existing token.
    #[must_use]
    pub fn with_token(id: Id, token: Token) -> Self {
        Self { id, token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_get_distinct_tokens() {
        let id: Id = "alice@tests".parse().unwrap();
        let a = Session::new(id.clone());
        let b = Session::new(id);
        assert_eq!(a.id, b.id);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn serde_shape() {
        let session = Session::with_token("a@t".parse().unwrap(), Token::from_string("tok".into()));
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json, serde_json::json!({"id": "a@t", "token": "tok"}));
    }
}
