//! Authentication and authorization hooks.
//!
//! Authenticators turn a [`SignIn`] into a [`Session`]; the first one that
//! accepts wins. Authorizers grant roles to a session; a role-gated handler
//! fires when any authorizer grants any of its roles.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use linkup_core::protocol::SignIn;
use linkup_core::{Id, Session};
use parking_lot::RwLock;
use tracing::debug;

/// Decides whether a sign-in is accepted.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// A new session for an accepted sign-in, `None` to pass.
    async fn authenticate(&self, sign_in: &SignIn) -> Option<Session>;
}

/// Decides whether a session holds a role.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `session` holds at least one of `roles`.
    async fn is_authorized(&self, session: &Session, roles: &[String]) -> bool;
}

/// Accepts every sign-in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllAuthenticator;

#[async_trait]
impl Authenticator for AcceptAllAuthenticator {
    async fn authenticate(&self, sign_in: &SignIn) -> Option<Session> {
        Some(Session::new(sign_in.id.clone()))
    }
}

/// Accepts sign-ins whose id belongs to one of a fixed set of domains.
#[derive(Debug, Clone)]
pub struct DomainAuthenticator {
    domains: HashSet<String>,
}

impl DomainAuthenticator {
    /// Accept ids in `domains` (compared lower-case).
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().to_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl Authenticator for DomainAuthenticator {
    async fn authenticate(&self, sign_in: &SignIn) -> Option<Session> {
        if self.domains.contains(sign_in.id.domain()) {
            Some(Session::new(sign_in.id.clone()))
        } else {
            debug!(id = %sign_in.id, "domain not allowed");
            None
        }
    }
}

/// Grants roles from an in-memory table keyed by id.
#[derive(Debug, Default)]
pub struct RoleAuthorizer {
    grants: RwLock<HashMap<Id, HashSet<String>>>,
}

impl RoleAuthorizer {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `role` to `id`.
    pub fn grant(&self, id: Id, role: impl Into<String>) {
        let _ = self.grants.write().entry(id).or_default().insert(role.into());
    }

    /// Withdraw `role` from `id`. Returns `false` if it was not granted.
    pub fn revoke(&self, id: &Id, role: &str) -> bool {
        self.grants
            .write()
            .get_mut(id)
            .is_some_and(|roles| roles.remove(role))
    }
}

#[async_trait]
impl Authorizer for RoleAuthorizer {
    async fn is_authorized(&self, session: &Session, roles: &[String]) -> bool {
        let grants = self.grants.read();
        grants
            .get(&session.id)
            .is_some_and(|held| roles.iter().any(|r| held.contains(r)))
    }
}
