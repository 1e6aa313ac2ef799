//! Live connections, session ownership and orphaned sessions.
//!
//! Held under one lock by the server. Every ownership change happens inside
//! a single call here, so an id never has zero or two owners mid-change.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use linkup_core::{ConnectionId, DisconnectReason, Id, Session, Token};
use tokio::time::Instant;

use crate::connection::ServerConnection;
use crate::session::SessionRepository;

struct Orphan {
    session: Session,
    since: Instant,
}

#[derive(Default)]
pub(crate) struct Directory {
    connections: HashMap<ConnectionId, Arc<ServerConnection>>,
    owners: HashMap<Id, Vec<ConnectionId>>,
    orphans: HashMap<Token, Orphan>,
}

impl Directory {
    pub(crate) fn insert(&mut self, connection: Arc<ServerConnection>) {
        let _ = self.connections.insert(connection.id().clone(), connection);
    }

    /// Drop a closed connection. Returns the session it still owned.
    pub(crate) fn remove(&mut self, connection: &ServerConnection) -> Option<Session> {
        let _ = self.connections.remove(connection.id());
        self.release(connection)
    }

    /// Make `connection` the sole owner of `session`.
    ///
    /// Other owners of the same id lose their session (and, unless they held
    /// this very token, its repository entry) and are returned for the caller
    /// to disconnect.
    pub(crate) fn claim(
        &mut self,
        connection: &ServerConnection,
        session: Session,
        repository: &dyn SessionRepository,
    ) -> Vec<Arc<ServerConnection>> {
        let mut evicted = Vec::new();
        for holder_id in self.owners.remove(&session.id).unwrap_or_default() {
            if &holder_id == connection.id() {
                continue;
            }
            let Some(holder) = self.connections.get(&holder_id) else {
                continue;
            };
            let _ = holder.record_reason(DisconnectReason::AnotherSessionOpened);
            if let Some(old) = holder.set_session(None) {
                if old.token != session.token {
                    let _ = repository.remove(&old);
                }
            }
            evicted.push(Arc::clone(holder));
        }

        if let Some(previous) = connection.set_session(Some(session.clone())) {
            if previous.id != session.id {
                self.disown(&previous.id, connection.id());
            }
            if previous.token != session.token {
                let _ = repository.remove(&previous);
            }
        }
        let _ = self.orphans.remove(&session.token);
        repository.add(session.clone());
        self.owners
            .entry(session.id)
            .or_default()
            .push(connection.id().clone());
        evicted
    }

    /// Take the session away from `connection`.
    pub(crate) fn release(&mut self, connection: &ServerConnection) -> Option<Session> {
        let session = connection.set_session(None)?;
        self.disown(&session.id, connection.id());
        Some(session)
    }

    fn disown(&mut self, id: &Id, connection_id: &ConnectionId) {
        if let Some(owners) = self.owners.get_mut(id) {
            owners.retain(|c| c != connection_id);
            if owners.is_empty() {
                let _ = self.owners.remove(id);
            }
        }
    }

    /// Remember a session whose connection went away.
    pub(crate) fn orphan(&mut self, session: Session, now: Instant) {
        let _ = self
            .orphans
            .insert(session.token.clone(), Orphan { session, since: now });
    }

    /// Remove and return sessions orphaned for at least `timeout`.
    pub(crate) fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<Session> {
        let expired: Vec<Token> = self
            .orphans
            .iter()
            .filter(|(_, o)| now.duration_since(o.since) >= timeout)
            .map(|(token, _)| token.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|token| self.orphans.remove(&token))
            .map(|o| o.session)
            .collect()
    }

    pub(crate) fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<Arc<ServerConnection>> {
        self.connections.get(id).cloned()
    }

    pub(crate) fn owners_of(&self, id: &Id) -> Vec<Arc<ServerConnection>> {
        self.owners
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|c| self.connections.get(c).cloned())
            .collect()
    }

    pub(crate) fn signed_in(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.owners.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every signed-in connection except `except`.
    pub(crate) fn signed_in_connections(
        &self,
        except: Option<&ConnectionId>,
    ) -> Vec<Arc<ServerConnection>> {
        self.owners
            .values()
            .flatten()
            .filter(|c| Some(*c) != except)
            .filter_map(|c| self.connections.get(c).cloned())
            .collect()
    }

    pub(crate) fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.connections.values().cloned().collect()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn anonymous_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| !c.is_signed_in())
            .count()
    }
}
