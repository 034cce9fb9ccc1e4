//! Packet length framing.
//!
//! Every frame on the wire, request or response, is a packed unsigned
//! integer length followed by `length` bytes of msgpack payload (a header
//! map and an optional body map). The decoder works over the unparsed tail
//! of a read buffer, so it must distinguish "more bytes needed" from
//! "malformed" before the full prefix has arrived.

use crate::error::ProtocolError;

/// Result of probing the unparsed tail for a packet length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCheck {
    /// The length prefix itself is truncated; wait for more bytes.
    Incomplete,
    /// A complete length prefix: `len` payload bytes follow the
    /// `prefix`-byte length encoding.
    Frame { len: usize, prefix: usize },
}

/// Probes `tail` for a packed-uint packet length.
///
/// Fails with `InvalidMsgpack("packet length")` when the leading byte is
/// not an unsigned integer marker; the payload itself is not examined.
pub fn read_packet_len(tail: &[u8]) -> Result<FrameCheck, ProtocolError> {
    let Some(&first) = tail.first() else {
        return Ok(FrameCheck::Incomplete);
    };
    let (prefix, len) = match first {
        0x00..=0x7f => (1, first as u64),
        0xcc => match tail.get(1) {
            Some(&b) => (2, b as u64),
            None => return Ok(FrameCheck::Incomplete),
        },
        0xcd => match tail.get(1..3) {
            Some(b) => (3, u16::from_be_bytes([b[0], b[1]]) as u64),
            None => return Ok(FrameCheck::Incomplete),
        },
        0xce => match tail.get(1..5) {
            Some(b) => (5, u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64),
            None => return Ok(FrameCheck::Incomplete),
        },
        0xcf => match tail.get(1..9) {
            Some(b) => (
                9,
                u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            ),
            None => return Ok(FrameCheck::Incomplete),
        },
        _ => return Err(ProtocolError::InvalidMsgpack("packet length")),
    };
    Ok(FrameCheck::Frame {
        len: len as usize,
        prefix,
    })
}

/// Writes a minimal packed-uint length prefix.
pub fn write_packet_len(out: &mut Vec<u8>, len: usize) {
    let len = len as u64;
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= u8::MAX as u64 {
        out.push(0xcc);
        out.push(len as u8);
    } else if len <= u16::MAX as u64 {
        out.push(0xcd);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= u32::MAX as u64 {
        out.push(0xce);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        out.push(0xcf);
        out.extend_from_slice(&len.to_be_bytes());
    }
}
