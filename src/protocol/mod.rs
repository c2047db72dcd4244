//! Protocol module - wire format, fragment detection, and stream reassembly.
//!
//! This module implements the binary link protocol:
//! - packet and parameter encoding/decoding (big-endian throughout)
//! - speculative fragment detection for partial TCP reads
//! - [`FrameBuffer`] accumulating stream bytes into complete packets

mod frame_buffer;
mod wire_format;

pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    decode_packet, decode_param, encode_packet, encode_packets, encode_param,
    is_packet_fragment, tags, Packet, PacketKind, PacketParam, PACKET_HEADER_SIZE,
};
