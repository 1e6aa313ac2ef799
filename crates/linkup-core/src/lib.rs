//! # linkup-core
//!
//! Shared vocabulary for the Linkup messaging substrate.
//!
//! - **Identities**: [`Id`] (`username@domain`), [`Token`], [`ConnectionId`]
//! - **Sessions**: [`Session`] pairs an `Id` with an opaque token
//! - **Packets**: [`Packet`] envelope with typed content via [`PacketContent`]
//! - **Type registry**: [`TypeRegistry`] resolves `TypeName` strings without reflection
//! - **Wire format**: [`JsonPacketCodec`] and the delimiter-based [`PacketFramer`]
//! - **Protocol**: sign-in/out/restore/disconnect payloads and [`DisconnectReason`]
//! - **Handlers**: [`HandlerTable`] with authentication/role gating for modules

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod framing;
pub mod handlers;
pub mod ids;
pub mod logging;
pub mod packet;
pub mod protocol;
pub mod registry;
pub mod session;

pub use codec::{JsonPacketCodec, PacketCodec};
pub use errors::{CodecError, CoreError, IdError, RegistryError, Result};
pub use framing::{Framing, PacketFramer, TOKEN};
pub use handlers::{Gate, HandlerRequirements, HandlerTable, PacketHandler};
pub use ids::{ConnectionId, Id, Token};
pub use packet::{Packet, PacketContent};
pub use protocol::{ConnectionState, DisconnectReason};
pub use registry::{Decoded, TypeRegistry};
pub use session::Session;
