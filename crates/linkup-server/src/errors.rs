//! Server error types.

use linkup_core::CodecError;
use linkup_transport::TransportError;
use thiserror::Error;

/// Convenience result alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Setup-time failures reported synchronously to the caller.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Endpoint parsing, certificate or bind failure.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// A payload could not be encoded.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// A listener for this endpoint is already running.
    #[error("listener already added for {0}")]
    ListenerExists(String),

    /// No listener runs on this endpoint.
    #[error("no listener for {0}")]
    ListenerNotFound(String),

    /// The module instance is already installed.
    #[error("module `{0}` already added")]
    ModuleAlreadyAdded(String),

    /// The authenticator instance is already installed.
    #[error("authenticator already added")]
    AuthenticatorAlreadyAdded,

    /// The authorizer instance is already installed.
    #[error("authorizer already added")]
    AuthorizerAlreadyAdded,

    /// `shutdown` has been called.
    #[error("server is shutting down")]
    ShuttingDown,
}
