//! Frame buffer for accumulating partial reads.
//!
//! TCP delivers an unstructured byte stream, so a packet can be split
//! anywhere. The buffer holds the bytes not yet resolved into packets and
//! extracts complete ones as data arrives:
//! - [`is_packet_fragment`] decides cheaply whether a whole packet is present
//! - [`decode_packet`] decodes it and the buffer shrinks to the unconsumed
//!   remainder after every successful decode

use std::sync::Arc;

use bytes::BytesMut;

use super::wire_format::{decode_packet, is_packet_fragment, Packet};
use crate::command::CommandRegistry;
use crate::error::BotlinkError;

/// Buffer for accumulating incoming bytes and extracting complete packets.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads, not yet resolved into packets.
    buffer: BytesMut,
    /// Registry used to resolve command ids while decoding.
    registry: Arc<CommandRegistry>,
}

impl FrameBuffer {
    /// Create an empty frame buffer decoding against `registry`.
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            registry,
        }
    }

    /// Push a chunk of stream data and extract every complete packet.
    ///
    /// Returns the ordered batch of packets decoded from the buffer (wire
    /// order) and, if a packet was malformed, the decode error. Packets
    /// decoded before the offending one are still returned — a bad frame
    /// aborts processing but never corrupts its predecessors in the batch.
    pub fn push(&mut self, data: &[u8]) -> (Vec<Packet>, Option<BotlinkError>) {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        loop {
            match self.try_extract_one() {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => return (packets, None),
                Err(e) => return (packets, Some(e)),
            }
        }
    }

    /// Try to extract a single packet from the front of the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(packet))` if a complete packet was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the frame is malformed
    fn try_extract_one(&mut self) -> Result<Option<Packet>, BotlinkError> {
        if is_packet_fragment(&self.buffer, 0) {
            return Ok(None);
        }
        let (consumed, packet) = decode_packet(&self.buffer, 0, &self.registry)?;
        // Drop the consumed bytes; the remainder is the new partial data.
        let _ = self.buffer.split_to(consumed);
        Ok(Some(packet))
    }

    /// Number of unresolved buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether no unresolved bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop all buffered bytes, e.g. when the connection cycles.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::protocol::wire_format::{encode_packets, PacketParam, PACKET_HEADER_SIZE};

    fn setup() -> (Arc<CommandRegistry>, Arc<Command>) {
        let registry = CommandRegistry::new();
        let echo = registry.register("ECHO").unwrap();
        (registry, echo)
    }

    #[test]
    fn test_single_complete_packet() {
        let (registry, echo) = setup();
        let packet = Packet::request(echo, 42, [PacketParam::Str("hi".to_string())]);
        let bytes = encode_packets(std::slice::from_ref(&packet));

        let mut buffer = FrameBuffer::new(registry);
        let (packets, err) = buffer.push(&bytes);

        assert!(err.is_none());
        assert_eq!(packets, vec![packet]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_split_into_two_chunks_equals_single_chunk() {
        let (registry, echo) = setup();
        let packet = Packet::request(
            echo,
            7,
            [PacketParam::Str("split me".to_string()), PacketParam::Int(3)],
        );
        let bytes = encode_packets(std::slice::from_ref(&packet));

        // Every non-empty split point must yield exactly the same packet.
        for cut in 1..bytes.len() {
            let mut buffer = FrameBuffer::new(registry.clone());
            let (first, err) = buffer.push(&bytes[..cut]);
            assert!(err.is_none());
            assert!(first.is_empty(), "packet surfaced before all bytes arrived");

            let (second, err) = buffer.push(&bytes[cut..]);
            assert!(err.is_none());
            assert_eq!(second, vec![packet.clone()]);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let (registry, echo) = setup();
        let packet = Packet::response(echo, -1, [PacketParam::Float(1.25)]);
        let bytes = encode_packets(std::slice::from_ref(&packet));

        let mut buffer = FrameBuffer::new(registry);
        let mut collected = Vec::new();
        for byte in bytes.iter() {
            let (packets, err) = buffer.push(&[*byte]);
            assert!(err.is_none());
            collected.extend(packets);
        }
        assert_eq!(collected, vec![packet]);
    }

    #[test]
    fn test_multiple_packets_one_chunk_preserve_wire_order() {
        let (registry, echo) = setup();
        let packets = vec![
            Packet::request(echo.clone(), 1, [PacketParam::Int(1)]),
            Packet::request(echo.clone(), 2, [PacketParam::Int(2)]),
            Packet::response(echo, 1, [PacketParam::Str("done".to_string())]),
        ];
        let bytes = encode_packets(&packets);

        let mut buffer = FrameBuffer::new(registry);
        let (decoded, err) = buffer.push(&bytes);
        assert!(err.is_none());
        assert_eq!(decoded, packets);
    }

    #[test]
    fn test_malformed_tail_preserves_decoded_prefix() {
        let (registry, echo) = setup();
        let good = Packet::request(echo.clone(), 1, [PacketParam::Int(1)]);
        let bad = Packet::request(echo, 2, [PacketParam::Int(2)]);

        let mut bytes = encode_packets(&[good.clone()]).to_vec();
        let mut bad_bytes = encode_packets(&[bad]).to_vec();
        bad_bytes[PACKET_HEADER_SIZE] = b'x'; // corrupt the param tag
        bytes.extend_from_slice(&bad_bytes);

        let mut buffer = FrameBuffer::new(registry);
        let (decoded, err) = buffer.push(&bytes);
        assert_eq!(decoded, vec![good]);
        assert!(matches!(err, Some(BotlinkError::Decode(_))));
    }

    #[test]
    fn test_clear_resets_partial_data() {
        let (registry, echo) = setup();
        let packet = Packet::request(echo, 1, [PacketParam::Int(1)]);
        let bytes = encode_packets(&[packet]);

        let mut buffer = FrameBuffer::new(registry);
        let (packets, _) = buffer.push(&bytes[..5]);
        assert!(packets.is_empty());
        assert_eq!(buffer.len(), 5);

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
