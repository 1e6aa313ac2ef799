//! Directory notifications published on a broadcast channel.

use linkup_core::{ConnectionId, DisconnectReason, Id, Session};

/// A change in who is signed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A connection signed in with a new session.
    ClientConnected {
        /// The connection that signed in.
        connection_id: ConnectionId,
        /// The session it now holds.
        session: Session,
    },
    /// A connection restored an existing session.
    ClientReconnected {
        /// The connection that adopted the session.
        connection_id: ConnectionId,
        /// The restored session.
        session: Session,
    },
    /// A signed-in connection signed out or went away.
    ClientDisconnected {
        /// The connection that left.
        connection_id: ConnectionId,
        /// The identity it held.
        id: Id,
        /// `ClientRequest` for a sign-out, otherwise why the channel closed.
        reason: DisconnectReason,
    },
}

impl ServerEvent {
    /// The connection the event is about.
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::ClientConnected { connection_id, .. }
            | Self::ClientReconnected { connection_id, .. }
            | Self::ClientDisconnected { connection_id, .. } => connection_id,
        }
    }
}
