//! Envelope codecs.

use crate::errors::CodecError;
use crate::packet::Packet;

/// Turns packets into bytes and back.
///
/// Implementations used with delimiter framing must never emit
/// [`crate::framing::TOKEN`] inside an encoded packet.
pub trait PacketCodec: Send + Sync {
    /// Encode one packet.
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError>;

    /// Decode one packet.
    fn decode(&self, bytes: &[u8]) -> Result<Packet, CodecError>;
}

/// JSON envelope: camelCase fields, absent sender/recipient omitted.
///
/// `serde_json` escapes every control character inside strings and emits
/// none outside them, so the output never contains the frame delimiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPacketCodec;

impl PacketCodec for JsonPacketCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(packet)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Packet, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
