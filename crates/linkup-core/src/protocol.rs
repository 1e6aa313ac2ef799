//! Protocol payloads exchanged by connections themselves.
//!
//! These packets drive the connect/sign-in/sign-out/restore/disconnect
//! state machine and are never handed to application modules.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::ids::Id;
use crate::packet::{Packet, PacketContent};
use crate::registry::TypeRegistry;
use crate::session::Session;

/// Why a connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The client asked to disconnect.
    ClientRequest,
    /// The server closed the connection.
    ServerRequest,
    /// The transport vanished without a `Disconnected` packet.
    ConnectionLost,
    /// The same identity signed in on another connection.
    AnotherSessionOpened,
    /// The connection did not sign in within the allowed window.
    AuthenticationTimeout,
}

impl DisconnectReason {
    /// Stable snake-case label (metrics, logs).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientRequest => "client_request",
            Self::ServerRequest => "server_request",
            Self::ConnectionLost => "connection_lost",
            Self::AnotherSessionOpened => "another_session_opened",
            Self::AuthenticationTimeout => "authentication_timeout",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport, or the transport has closed.
    #[default]
    Disconnected,
    /// Transport opening, `Connected` not yet received.
    Connecting,
    /// Transport open, not signed in.
    Connected,
    /// Holding a session.
    SignedIn,
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Sign-in request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignIn {
    /// Requested identity.
    pub id: Id,
    /// Opaque credential material for authenticators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl SignIn {
    /// Sign in without credentials.
    #[must_use]
    pub fn new(id: Id) -> Self {
        Self { id, secret: None }
    }

    /// Attach credential material.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

impl fmt::Debug for SignIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignIn")
            .field("id", &self.id)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Sign-in or restore accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedIn {
    /// Session now held by the connection.
    pub session: Session,
}

/// Sign-out request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOut {
    /// Session to close.
    pub session: Session,
}

/// Sign-out reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOut {
    /// Session named in the request.
    pub session: Session,
    /// Whether it was the connection's current session.
    pub is_current_session: bool,
}

/// Session restore request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSession {
    /// Session to adopt.
    pub session: Session,
}

/// Sign-in or restore rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationFailed {
    /// Identity that was rejected.
    pub id: Id,
}

/// Server acknowledgement of a newly opened connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {}

/// Announces the sender is closing the connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnected {
    /// Why.
    pub reason: DisconnectReason,
}

macro_rules! protocol_types {
    ($($ty:ident => $name:literal),* $(,)?) => {
        $(
            impl PacketContent for $ty {
                const TYPE_NAME: &'static str = $name;
            }
        )*

        /// A decoded protocol packet.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum ProtocolMessage {
            $(
                #[allow(missing_docs)]
                $ty($ty),
            )*
        }

        impl ProtocolMessage {
            /// Recognize a protocol packet.
            ///
            /// Returns `None` for application packets and `Some(Err(_))` for a
            /// protocol type name whose content does not decode.
            pub fn parse(packet: &Packet) -> Option<Result<Self, CodecError>> {
                match packet.type_name.as_str() {
                    $(
                        $name => Some(packet.content::<$ty>().map(Self::$ty)),
                    )*
                    _ => None,
                }
            }

            /// Whether `type_name` belongs to the protocol.
            pub fn is_protocol(type_name: &str) -> bool {
                matches!(type_name, $($name)|*)
            }
        }

        /// Register every protocol payload with `registry`.
        pub(crate) fn register_protocol_types(registry: &TypeRegistry) {
            $(
                let _ = registry.register::<$ty>();
            )*
        }
    };
}

protocol_types! {
    SignIn => "linkup.SignIn",
    SignedIn => "linkup.SignedIn",
    SignOut => "linkup.SignOut",
    SignedOut => "linkup.SignedOut",
    RestoreSession => "linkup.RestoreSession",
    AuthenticationFailed => "linkup.AuthenticationFailed",
    Connected => "linkup.Connected",
    Disconnected => "linkup.Disconnected",
}
