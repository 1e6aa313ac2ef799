//! The packet envelope and typed content.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::CodecError;
use crate::ids::Id;

/// A payload type that can travel inside a [`Packet`].
///
/// `TYPE_NAME` is the stable, codec-independent key peers use to resolve
/// the payload type. It must be unique per deployment.
pub trait PacketContent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire name for this payload type.
    const TYPE_NAME: &'static str;
}

/// The wire envelope: addressing plus JSON-encoded typed content.
///
/// `content` holds the payload's JSON text; `recipient == None` means
/// broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Origin identity, stamped by the sending connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Id>,
    /// Destination identity; `None` broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Id>,
    /// Encoded payload.
    pub content: String,
    /// Payload type key.
    pub type_name: String,
}

impl Packet {
    /// Encode `content` into an unaddressed packet.
    pub fn new<T: PacketContent>(content: &T) -> Result<Self, CodecError> {
        Ok(Self {
            sender: None,
            recipient: None,
            content: serde_json::to_string(content)?,
            type_name: T::TYPE_NAME.to_owned(),
        })
    }

    /// Address the packet to `recipient`.
    #[must_use]
    pub fn to(mut self, recipient: Id) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Whether the packet carries a `T`.
    pub fn is<T: PacketContent>(&self) -> bool {
        self.type_name == T::TYPE_NAME
    }

    /// Decode the content as `T`.
    pub fn content<T: PacketContent>(&self) -> Result<T, CodecError> {
        if !self.is::<T>() {
            return Err(CodecError::TypeMismatch {
                expected: T::TYPE_NAME,
                actual: self.type_name.clone(),
            });
        }
        Ok(serde_json::from_str(&self.content)?)
    }

    /// Decode the content as `T`, falling back to `T::default()` on failure.
    pub fn content_or_default<T: PacketContent + Default>(&self) -> T {
        self.content::<T>().unwrap_or_else(|e| {
            warn!(type_name = %self.type_name, error = %e, "packet content decode failed");
            T::default()
        })
    }
}
