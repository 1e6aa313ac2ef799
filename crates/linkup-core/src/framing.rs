//! Delimiter framing for stream transports.
//!
//! Byte-stream transports carry no message boundaries, so every encoded
//! packet is followed by [`TOKEN`]. The decoder scans the receive buffer
//! from the front and yields one packet per token, removing the consumed
//! prefix. Message transports use [`Framing::Message`]: one message is one
//! packet.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::codec::{JsonPacketCodec, PacketCodec};
use crate::errors::CodecError;
use crate::packet::Packet;

/// Frame delimiter appended to every packet on stream transports.
pub const TOKEN: [u8; 3] = [0x07, 0x0C, 0x0B];

/// How packet boundaries are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Packets are suffixed with [`TOKEN`].
    Delimited,
    /// The transport delivers whole messages.
    Message,
}

fn find_token(haystack: &[u8]) -> Option<usize> {
    haystack.windows(TOKEN.len()).position(|w| w == TOKEN)
}

/// Codec wrapper that applies a [`Framing`] on top of a [`PacketCodec`].
///
/// Undecodable frames are logged and skipped; they never end the stream.
#[derive(Clone)]
pub struct PacketFramer {
    codec: Arc<dyn PacketCodec>,
    framing: Framing,
    // Prefix of the buffer already known to be token-free.
    scanned: usize,
}

impl PacketFramer {
    /// Build a framer over `codec`.
    pub fn new(codec: Arc<dyn PacketCodec>, framing: Framing) -> Self {
        Self {
            codec,
            framing,
            scanned: 0,
        }
    }

    /// JSON codec with delimiter framing.
    pub fn delimited() -> Self {
        Self::new(Arc::new(JsonPacketCodec), Framing::Delimited)
    }

    /// JSON codec with message framing.
    pub fn message() -> Self {
        Self::new(Arc::new(JsonPacketCodec), Framing::Message)
    }

    /// Framing in use.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Encode one packet into a standalone frame.
    pub fn encode_frame(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let mut bytes = self.codec.encode(packet)?;
        if self.framing == Framing::Delimited {
            if find_token(&bytes).is_some() {
                return Err(CodecError::DelimiterInPayload);
            }
            bytes.extend_from_slice(&TOKEN);
        }
        Ok(bytes)
    }

    /// Decode one whole message, or `None` if it is not a valid packet.
    pub fn decode_message(&self, bytes: &[u8]) -> Option<Packet> {
        match self.codec.decode(bytes) {
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "dropping undecodable packet");
                None
            }
        }
    }
}

impl std::fmt::Debug for PacketFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFramer")
            .field("framing", &self.framing)
            .field("scanned", &self.scanned)
            .finish_non_exhaustive()
    }
}

impl Decoder for PacketFramer {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if self.framing == Framing::Message {
            if src.is_empty() {
                return Ok(None);
            }
            let frame = src.split();
            return Ok(self.decode_message(&frame));
        }

        loop {
            let start = self.scanned.min(src.len());
            let Some(pos) = find_token(&src[start..]).map(|p| p + start) else {
                // A token may straddle the end of the buffer.
                self.scanned = src.len().saturating_sub(TOKEN.len() - 1);
                return Ok(None);
            };
            let frame = src.split_to(pos);
            src.advance(TOKEN.len());
            self.scanned = 0;
            if frame.is_empty() {
                continue;
            }
            if let Some(packet) = self.decode_message(&frame) {
                return Ok(Some(packet));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if let Some(packet) = self.decode(src)? {
            return Ok(Some(packet));
        }
        if !src.is_empty() {
            debug!(len = src.len(), "discarding partial frame at end of stream");
            src.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

impl Encoder<&Packet> for PacketFramer {
    type Error = CodecError;

    fn encode(&mut self, packet: &Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let frame = self.encode_frame(packet)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketContent;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Seq {
        n: usize,
        text: String,
    }

    impl PacketContent for Seq {
        const TYPE_NAME: &'static str = "test.seq";
    }

    fn packet(n: usize, text: &str) -> Packet {
        Packet::new(&Seq {
            n,
            text: text.to_owned(),
        })
        .unwrap()
    }

    fn drain(framer: &mut PacketFramer, buf: &mut BytesMut, out: &mut Vec<Packet>) {
        while let Some(p) = framer.decode(buf).unwrap() {
            out.push(p);
        }
    }

    #[test]
    fn frame_ends_with_token() {
        let frame = PacketFramer::delimited().encode_frame(&packet(1, "a")).unwrap();
        assert!(frame.ends_with(&TOKEN));
        let message = PacketFramer::message().encode_frame(&packet(1, "a")).unwrap();
        assert!(!message.ends_with(&TOKEN));
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut framer = PacketFramer::delimited();
        let mut buf = BytesMut::new();
        for n in 0..3 {
            buf.extend_from_slice(&framer.encode_frame(&packet(n, "x")).unwrap());
        }
        let mut out = Vec::new();
        drain(&mut framer, &mut buf, &mut out);
        assert_eq!(out.len(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn token_split_across_reads() {
        let mut framer = PacketFramer::delimited();
        let frame = framer.encode_frame(&packet(7, "split")).unwrap();
        let cut = frame.len() - 2;
        let mut buf = BytesMut::from(&frame[..cut]);
        assert!(framer.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[cut..]);
        let p = framer.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p.content::<Seq>().unwrap().n, 7);
    }

    #[test]
    fn garbage_frame_is_skipped() {
        let mut framer = PacketFramer::delimited();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"garbage");
        buf.extend_from_slice(&TOKEN);
        buf.extend_from_slice(&TOKEN);
        buf.extend_from_slice(&framer.encode_frame(&packet(2, "ok")).unwrap());
        let p = framer.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p.content::<Seq>().unwrap().n, 2);
        assert!(framer.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_dropped_at_eof() {
        let mut framer = PacketFramer::delimited();
        let mut buf = BytesMut::from(&b"{\"content\""[..]);
        assert!(framer.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn message_framing_takes_whole_buffer() {
        let mut framer = PacketFramer::message();
        let frame = framer.encode_frame(&packet(3, "m")).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let p = framer.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p.content::<Seq>().unwrap().n, 3);
        assert!(buf.is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_chunking_preserves_count_and_order(
            texts in proptest::collection::vec("[ -~\\x07\\x0b\\x0c]{0,40}", 1..12),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..24),
        ) {
            let mut framer = PacketFramer::delimited();
            let mut wire = Vec::new();
            for (n, text) in texts.iter().enumerate() {
                wire.extend_from_slice(&framer.encode_frame(&packet(n, text)).unwrap());
            }

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(wire.len() + 1)).collect();
            points.push(0);
            points.push(wire.len());
            points.sort_unstable();
            points.dedup();

            let mut buf = BytesMut::new();
            let mut out = Vec::new();
            for pair in points.windows(2) {
                buf.extend_from_slice(&wire[pair[0]..pair[1]]);
                drain(&mut framer, &mut buf, &mut out);
            }

            prop_assert_eq!(out.len(), texts.len());
            for (n, (p, text)) in out.iter().zip(&texts).enumerate() {
                let seq = p.content::<Seq>().unwrap();
                prop_assert_eq!(seq.n, n);
                prop_assert_eq!(&seq.text, text);
            }
            prop_assert!(buf.is_empty());
        }
    }
}
