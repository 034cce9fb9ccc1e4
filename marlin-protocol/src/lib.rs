//! # marlin-protocol
//!
//! Wire protocol implementation for marlin (MBP - marlin binary protocol).
//!
//! This crate provides:
//! - Packed-uint length framing over MessagePack payloads
//! - Request header/body decoding and request encoding
//! - Response encoding/decoding with OK, error and DATA bodies
//! - The fixed 128-byte connection greeting
//! - Stable error codes and protocol constants

pub mod error;
pub mod frame;
pub mod greeting;
pub mod reply;
pub mod request;

pub use error::{ClientError, ErrorCode, ProtocolError};
pub use frame::{read_packet_len, FrameCheck};
pub use greeting::{decode_greeting, encode_greeting, Greeting};
pub use reply::{decode_response, encode_data, encode_error, encode_ok, Response};
pub use request::{
    decode_header, decode_request, encode_request, AuthRequest, CallRequest, DmlRequest,
    RequestBody, RequestHeader, RequestType,
};

/// Default port for the marlin server.
pub const DEFAULT_PORT: u16 = 7427;

/// Size of the connection greeting in bytes.
pub const GREETING_SIZE: usize = 128;

/// Size of the per-session authentication salt.
pub const SALT_SIZE: usize = 32;

/// Smallest possible valid request frame: a one-byte length prefix and a
/// header map with a single key/value pair.
pub const MIN_REQUEST_SIZE: usize = 3;

/// Bit set in a response code to mark an error reply; the low bits carry
/// the numeric [`ErrorCode`].
pub const ERROR_TYPE_BIT: u32 = 0x8000;
