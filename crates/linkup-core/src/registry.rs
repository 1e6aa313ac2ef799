//! Explicit `TypeName → payload type` registry.
//!
//! Payload types are registered by name at startup (usually by the module
//! that handles them). Decoding a packet whose type name was never
//! registered yields [`Decoded::Unknown`] and logs a protocol fault; it
//! never fails the caller.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::RegistryError;
use crate::packet::{Packet, PacketContent};
use crate::protocol;

type DecodeFn = fn(&str) -> Result<Box<dyn Any + Send>, serde_json::Error>;

fn decode_as<T: PacketContent>(content: &str) -> Result<Box<dyn Any + Send>, serde_json::Error> {
    Ok(Box::new(serde_json::from_str::<T>(content)?))
}

struct TypeEntry {
    rust_type: TypeId,
    rust_name: &'static str,
    decode: DecodeFn,
}

/// Result of decoding a packet through the registry.
pub enum Decoded {
    /// Registered type, decoded successfully.
    Known {
        /// The packet's type name.
        type_name: String,
        /// The decoded payload; downcast with [`Decoded::downcast`].
        value: Box<dyn Any + Send>,
    },
    /// The type name is not registered.
    Unknown {
        /// The unrecognized type name.
        type_name: String,
        /// Raw encoded content.
        raw: String,
    },
    /// Registered type whose content failed to decode.
    Malformed {
        /// The packet's type name.
        type_name: String,
        /// Decoder error message.
        error: String,
    },
}

impl Decoded {
    /// Whether the payload was decoded into a registered type.
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known { .. })
    }

    /// The packet's type name, whatever the outcome.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Known { type_name, .. }
            | Self::Unknown { type_name, .. }
            | Self::Malformed { type_name, .. } => type_name,
        }
    }

    /// Take the decoded value as `T`.
    pub fn downcast<T: PacketContent>(self) -> Option<T> {
        match self {
            Self::Known { value, .. } => value.downcast::<T>().ok().map(|b| *b),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Decoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known { type_name, .. } => f.debug_struct("Known").field("type_name", type_name).finish_non_exhaustive(),
            Self::Unknown { type_name, .. } => f.debug_struct("Unknown").field("type_name", type_name).finish_non_exhaustive(),
            Self::Malformed { type_name, error } => f
                .debug_struct("Malformed")
                .field("type_name", type_name)
                .field("error", error)
                .finish(),
        }
    }
}

/// Registry of payload types, keyed by [`PacketContent::TYPE_NAME`].
///
/// Read-mostly and append-only; share it behind an `Arc`.
pub struct TypeRegistry {
    types: RwLock<HashMap<String, TypeEntry>>,
}

impl TypeRegistry {
    /// Registry pre-populated with the protocol payloads.
    pub fn new() -> Self {
        let registry = Self::empty();
        protocol::register_protocol_types(&registry);
        registry
    }

    /// Registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
        }
    }

    /// Register `T` under its type name.
    ///
    /// Returns `Ok(true)` when newly added, `Ok(false)` when `T` was already
    /// registered, and an error when the name belongs to a different type.
    pub fn register<T: PacketContent>(&self) -> Result<bool, RegistryError> {
        let mut types = self.types.write();
        if let Some(existing) = types.get(T::TYPE_NAME) {
            if existing.rust_type == TypeId::of::<T>() {
                return Ok(false);
            }
            return Err(RegistryError::Conflict {
                name: T::TYPE_NAME.to_owned(),
                existing: existing.rust_name,
            });
        }
        let _ = types.insert(
            T::TYPE_NAME.to_owned(),
            TypeEntry {
                rust_type: TypeId::of::<T>(),
                rust_name: type_name::<T>(),
                decode: decode_as::<T>,
            },
        );
        debug!(type_name = T::TYPE_NAME, rust_type = type_name::<T>(), "registered packet type");
        Ok(true)
    }

    /// Whether a type name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.types.read().contains_key(name)
    }

    /// Whether the packet's type name resolves to `T`.
    pub fn is<T: PacketContent>(&self, packet: &Packet) -> bool {
        self.types
            .read()
            .get(&packet.type_name)
            .is_some_and(|entry| entry.rust_type == TypeId::of::<T>())
    }

    /// Decode a packet's content through its registered type.
    pub fn decode(&self, packet: &Packet) -> Decoded {
        let decode = self.types.read().get(&packet.type_name).map(|entry| entry.decode);
        let Some(decode) = decode else {
            warn!(type_name = %packet.type_name, "packet carries an unregistered type");
            return Decoded::Unknown {
                type_name: packet.type_name.clone(),
                raw: packet.content.clone(),
            };
        };
        match decode(&packet.content) {
            Ok(value) => Decoded::Known {
                type_name: packet.type_name.clone(),
                value,
            },
            Err(e) => {
                warn!(type_name = %packet.type_name, error = %e, "packet content is malformed");
                Decoded::Malformed {
                    type_name: packet.type_name.clone(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// All registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
