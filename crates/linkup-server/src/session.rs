//! Session storage.
//!
//! The server persists every issued session so a later connection can
//! restore it by token. [`MemorySessionRepository`] keeps them in process;
//! a deployment shares sessions across processes by implementing
//! [`SessionRepository`] over its own store.

use std::collections::HashMap;

use linkup_core::{Session, Token};
use parking_lot::Mutex;

/// Token-keyed session store. Implementations must be safe to call from any
/// connection task.
pub trait SessionRepository: Send + Sync {
    /// Insert or replace the session stored under its token.
    fn add(&self, session: Session);

    /// The session stored under `token`.
    fn get(&self, token: &Token) -> Option<Session>;

    /// Remove `session` if the entry under its token still belongs to it.
    fn remove(&self, session: &Session) -> bool;

    /// Whether a session is stored under `token`.
    fn contains(&self, token: &Token) -> bool;

    /// Number of stored sessions.
    fn len(&self) -> usize;

    /// Whether nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process [`SessionRepository`].
#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: Mutex<HashMap<Token, Session>>,
}

impl MemorySessionRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRepository for MemorySessionRepository {
    fn add(&self, session: Session) {
        let _ = self.sessions.lock().insert(session.token.clone(), session);
    }

    fn get(&self, token: &Token) -> Option<Session> {
        self.sessions.lock().get(token).cloned()
    }

    fn remove(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.get(&session.token) == Some(session) {
            let _ = sessions.remove(&session.token);
            true
        } else {
            false
        }
    }

    fn contains(&self, token: &Token) -> bool {
        self.sessions.lock().contains_key(token)
    }

    fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkup_core::Id;

    fn id(s: &str) -> Id {
        s.parse().unwrap()
    }

    #[test]
    fn add_get_contains() {
        let repo = MemorySessionRepository::new();
        let session = Session::new(id("alice@tests"));
        repo.add(session.clone());
        assert!(repo.contains(&session.token));
        assert_eq!(repo.get(&session.token), Some(session));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn add_is_an_upsert() {
        let repo = MemorySessionRepository::new();
        let session = Session::new(id("alice@tests"));
        repo.add(session.clone());
        repo.add(session);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn remove_requires_matching_entry() {
        let repo = MemorySessionRepository::new();
        let session = Session::new(id("alice@tests"));
        repo.add(session.clone());

        let impostor = Session::with_token(id("mallory@tests"), session.token.clone());
        assert!(!repo.remove(&impostor));
        assert!(repo.contains(&session.token));

        assert!(repo.remove(&session));
        assert!(!repo.remove(&session));
        assert!(repo.is_empty());
    }

    #[test]
    fn sessions_for_one_id_are_independent() {
        let repo = MemorySessionRepository::new();
        let first = Session::new(id("alice@tests"));
        let second = Session::new(id("alice@tests"));
        repo.add(first.clone());
        repo.add(second.clone());
        assert!(repo.remove(&first));
        assert_eq!(repo.get(&second.token), Some(second));
    }
}
