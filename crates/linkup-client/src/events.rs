//! Connection lifecycle notifications.

use linkup_core::{DisconnectReason, Id, Session};

/// Something that happened to a [`ClientConnection`](crate::ClientConnection).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// The server acknowledged the connection.
    Connected,
    /// A sign-in or restore was accepted.
    SignedIn(Session),
    /// The current session was closed.
    SignedOut(Session),
    /// A sign-in or restore was rejected.
    AuthenticationFailed(Id),
    /// The connection ended.
    Disconnected(DisconnectReason),
}
