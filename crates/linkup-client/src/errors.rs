//! Client error types.

use linkup_core::{CodecError, Id};
use linkup_transport::TransportError;
use thiserror::Error;

/// Convenience result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Why a client call did not complete.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Endpoint parsing or channel setup failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// A payload could not be encoded.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// `connect` was already called on this connection.
    #[error("connection already used; create a new one to reconnect")]
    AlreadyUsed,

    /// The call needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// The call needs a session.
    #[error("not signed in")]
    NotSignedIn,

    /// The server rejected the sign-in or restore.
    #[error("authentication failed for {0}")]
    AuthenticationFailed(Id),

    /// The connection closed before the reply arrived.
    #[error("connection closed while waiting for the server")]
    Disconnected,

    /// Another sign-in, restore or sign-out is awaiting its reply.
    #[error("another session request is awaiting its reply")]
    RequestInFlight,

    /// No reply within the configured timeout.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The module instance is already installed.
    #[error("module `{0}` already added")]
    ModuleAlreadyAdded(String),
}
