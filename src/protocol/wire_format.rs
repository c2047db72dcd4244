//! Wire format encoding and decoding.
//!
//! Implements the link packet layout:
//! ```text
//! ┌─────────┬──────────┬───────────┬────────────┬────────────┐
//! │ Dir     │ Command  │ RequestId │ ParamCount │ Params     │
//! │ 1 byte  │ 4 bytes  │ 4 bytes   │ 4 bytes    │ variable   │
//! │ '>'|'<' │ ASCII id │ int32 BE  │ int32 BE   │            │
//! └─────────┴──────────┴───────────┴────────────┴────────────┘
//!
//! Param := TypeTag(1B: 'i'|'f'|'s') Value
//! Value(i) := int32 BE
//! Value(f) := float32 BE
//! Value(s) := Length(int32 BE) UTF8Bytes[Length]
//! ```
//!
//! All multi-byte integers are Big Endian.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::command::{Command, CommandRegistry};
use crate::error::{BotlinkError, Result};

/// Fixed packet header size: direction + command id + request id + param
/// count. A buffer holding fewer bytes cannot hold a packet.
pub const PACKET_HEADER_SIZE: usize = 13;

/// Single byte tags used on the wire.
pub mod tags {
    /// Direction tag for request packets.
    pub const DIR_REQUEST: u8 = b'>';
    /// Direction tag for response packets.
    pub const DIR_RESPONSE: u8 = b'<';
    /// Type tag for 32-bit signed integer parameters.
    pub const PARAM_INT: u8 = b'i';
    /// Type tag for 32-bit IEEE-754 float parameters.
    pub const PARAM_FLOAT: u8 = b'f';
    /// Type tag for length-prefixed UTF-8 string parameters.
    pub const PARAM_STRING: u8 = b's';
}

/// A single typed packet parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketParam {
    /// 32-bit signed integer.
    Int(i32),
    /// 32-bit IEEE-754 float.
    Float(f32),
    /// UTF-8 string, length-prefixed on the wire.
    Str(String),
}

impl PacketParam {
    /// Number of bytes this parameter occupies on the wire, tag included.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Int(_) | Self::Float(_) => 1 + 4,
            Self::Str(s) => 1 + 4 + s.len(),
        }
    }
}

impl From<i32> for PacketParam {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f32> for PacketParam {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<String> for PacketParam {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for PacketParam {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Whether a packet is a request for data/action or a response to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// A request, `>` on the wire.
    Request,
    /// A response, `<` on the wire. Always carries the request id it answers.
    Response,
}

/// One complete unit of the wire protocol.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Request or response.
    pub kind: PacketKind,
    /// The command this packet carries.
    pub command: Arc<Command>,
    /// Correlates responses back to the request that caused them.
    pub request_id: i32,
    /// Ordered parameter list.
    pub params: Vec<PacketParam>,
}

impl Packet {
    /// Build a packet. Parameters with no value (trailing optionals passed
    /// as `None`) are omitted, so the encoded count reflects only present
    /// parameters.
    pub fn new<I, P>(kind: PacketKind, command: Arc<Command>, request_id: i32, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Option<PacketParam>>,
    {
        Self {
            kind,
            command,
            request_id,
            params: params.into_iter().filter_map(Into::into).collect(),
        }
    }

    /// Build a request packet.
    pub fn request<I, P>(command: Arc<Command>, request_id: i32, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Option<PacketParam>>,
    {
        Self::new(PacketKind::Request, command, request_id, params)
    }

    /// Build a response packet carrying the id of the request it answers.
    pub fn response<I, P>(command: Arc<Command>, request_id: i32, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Option<PacketParam>>,
    {
        Self::new(PacketKind::Response, command, request_id, params)
    }

    /// Whether this packet is a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.kind == PacketKind::Request
    }

    /// Whether this packet is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.kind == PacketKind::Response
    }

    /// Number of bytes this packet occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.params.iter().map(PacketParam::encoded_len).sum::<usize>()
    }
}

impl PartialEq for Packet {
    /// Packets compare by wire content; the command compares by id, not by
    /// handler identity.
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.request_id == other.request_id
            && self.command.id() == other.command.id()
            && self.params == other.params
    }
}

/// Encode one parameter into `buf`.
pub fn encode_param(param: &PacketParam, buf: &mut BytesMut) {
    match param {
        PacketParam::Int(v) => {
            buf.put_u8(tags::PARAM_INT);
            buf.put_i32(*v);
        }
        PacketParam::Float(v) => {
            buf.put_u8(tags::PARAM_FLOAT);
            buf.put_f32(*v);
        }
        PacketParam::Str(s) => {
            buf.put_u8(tags::PARAM_STRING);
            buf.put_i32(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
    }
}

/// Encode one packet into `buf`.
pub fn encode_packet(packet: &Packet, buf: &mut BytesMut) {
    buf.reserve(packet.encoded_len());
    buf.put_u8(match packet.kind {
        PacketKind::Request => tags::DIR_REQUEST,
        PacketKind::Response => tags::DIR_RESPONSE,
    });
    buf.put_slice(packet.command.id_bytes());
    buf.put_i32(packet.request_id);
    buf.put_i32(packet.params.len() as i32);
    for param in &packet.params {
        encode_param(param, buf);
    }
}

/// Encode a slice of packets into one contiguous buffer, wire order equal to
/// slice order. Used for single-write sends.
pub fn encode_packets(packets: &[Packet]) -> BytesMut {
    let total: usize = packets.iter().map(Packet::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for packet in packets {
        encode_packet(packet, &mut buf);
    }
    buf
}

/// Read a big-endian i32 at `off`, or `None` when truncated.
fn read_i32_at(buf: &[u8], off: usize) -> Option<i32> {
    let raw: [u8; 4] = buf.get(off..off + 4)?.try_into().ok()?;
    Some(i32::from_be_bytes(raw))
}

/// Read a big-endian f32 at `off`, or `None` when truncated.
fn read_f32_at(buf: &[u8], off: usize) -> Option<f32> {
    let raw: [u8; 4] = buf.get(off..off + 4)?.try_into().ok()?;
    Some(f32::from_be_bytes(raw))
}

fn truncated(what: &str) -> BotlinkError {
    BotlinkError::Decode(format!("buffer ended inside {what}"))
}

/// Decode one parameter starting at `off`.
///
/// Returns the new buffer offset alongside the decoded value so callers can
/// decode a sequence of parameters from one buffer.
pub fn decode_param(buf: &[u8], off: usize) -> Result<(usize, PacketParam)> {
    let tag = *buf.get(off).ok_or_else(|| truncated("param type tag"))?;
    let off = off + 1;
    match tag {
        tags::PARAM_INT => {
            let value = read_i32_at(buf, off).ok_or_else(|| truncated("int param"))?;
            Ok((off + 4, PacketParam::Int(value)))
        }
        tags::PARAM_FLOAT => {
            let value = read_f32_at(buf, off).ok_or_else(|| truncated("float param"))?;
            Ok((off + 4, PacketParam::Float(value)))
        }
        tags::PARAM_STRING => {
            let len = read_i32_at(buf, off).ok_or_else(|| truncated("string length"))?;
            let len = usize::try_from(len).map_err(|_| {
                BotlinkError::Decode(format!("string param has negative length {len}"))
            })?;
            let off = off + 4;
            let raw = buf
                .get(off..off + len)
                .ok_or_else(|| truncated("string param"))?;
            let value = std::str::from_utf8(raw)
                .map_err(|e| BotlinkError::Decode(format!("string param is not UTF-8: {e}")))?;
            Ok((off + len, PacketParam::Str(value.to_string())))
        }
        other => Err(BotlinkError::Decode(format!(
            "{:?} is not a valid param type tag",
            other as char
        ))),
    }
}

/// Decode one packet starting at `off`, resolving its command against the
/// registry.
///
/// Returns the new buffer offset alongside the packet so callers can decode
/// a sequence of packets from one buffer.
pub fn decode_packet(
    buf: &[u8],
    off: usize,
    registry: &CommandRegistry,
) -> Result<(usize, Packet)> {
    let dir = *buf.get(off).ok_or_else(|| truncated("direction tag"))?;
    let kind = match dir {
        tags::DIR_REQUEST => PacketKind::Request,
        tags::DIR_RESPONSE => PacketKind::Response,
        other => {
            return Err(BotlinkError::Decode(format!(
                "{:?} is not a valid direction tag",
                other as char
            )))
        }
    };
    let off = off + 1;

    let raw_id = buf.get(off..off + 4).ok_or_else(|| truncated("command id"))?;
    let id = std::str::from_utf8(raw_id)
        .map_err(|e| BotlinkError::Decode(format!("command id is not ASCII: {e}")))?;
    let command = registry
        .find(id)
        .ok_or_else(|| BotlinkError::UnknownCommand(id.to_string()))?;
    let off = off + 4;

    let request_id = read_i32_at(buf, off).ok_or_else(|| truncated("request id"))?;
    let off = off + 4;

    let n_params = read_i32_at(buf, off).ok_or_else(|| truncated("param count"))?;
    if n_params < 0 {
        return Err(BotlinkError::Decode(format!(
            "packet declares negative param count {n_params}"
        )));
    }
    let mut off = off + 4;

    let mut params = Vec::with_capacity(n_params as usize);
    for _ in 0..n_params {
        let (new_off, param) = decode_param(buf, off)?;
        off = new_off;
        params.push(param);
    }

    Ok((off, Packet { kind, command, request_id, params }))
}

/// Speculative completeness check: does `buf` hold a whole packet at `off`?
///
/// Returns `true` while the packet is still a fragment, i.e. more bytes are
/// needed. TCP delivers an unstructured byte stream that can split a packet
/// anywhere, so this walks the declared layout without decoding payloads and
/// bails the instant a required byte range runs past the buffer.
///
/// Malformed input (unknown type tag, negative string length) reports
/// "complete" — the condition is not truncation and the decoder is the one
/// that raises it. This keeps the guarantee that a frame reported complete
/// never fails to decode *due to truncation*, without ever stalling the
/// stream on garbage.
pub fn is_packet_fragment(buf: &[u8], off: usize) -> bool {
    if buf.len().saturating_sub(off) < PACKET_HEADER_SIZE {
        return true;
    }
    // Header is present; param count sits after dir + command id + request id.
    let Some(n_params) = read_i32_at(buf, off + 9) else {
        return true;
    };

    let mut pos = off + PACKET_HEADER_SIZE;
    for _ in 0..n_params.max(0) {
        let Some(&tag) = buf.get(pos) else {
            return true;
        };
        pos += 1;
        match tag {
            tags::PARAM_INT | tags::PARAM_FLOAT => {
                if buf.len() < pos + 4 {
                    return true;
                }
                pos += 4;
            }
            tags::PARAM_STRING => {
                let Some(len) = read_i32_at(buf, pos) else {
                    return true;
                };
                pos += 4;
                let Ok(len) = usize::try_from(len) else {
                    // Negative length: malformed, not truncated.
                    return false;
                };
                if buf.len() < pos + len {
                    return true;
                }
                pos += len;
            }
            // Unknown tag: malformed, not truncated.
            _ => return false,
        }
    }
    false
}
