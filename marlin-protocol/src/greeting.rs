//! The 128-byte connection greeting.
//!
//! Sent by the server before any request is read. Two 64-byte
//! newline-terminated lines: the first carries the server version and
//! instance UUID, the second the base64 encoding of the per-session salt
//! used as the authentication challenge.
//!
//! ```text
//! Marlin 0.1.0 (Binary) 550e8400-e29b-41d4-a716-446655440000
//! yA3yQGyHTLJGHbXGTFhWn2wSJSMwVS3UbbWklzUpTg0=
//! ```

use crate::error::ProtocolError;
use crate::{GREETING_SIZE, SALT_SIZE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

const LINE_SIZE: usize = GREETING_SIZE / 2;

/// A decoded greeting block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: String,
    pub uuid: Uuid,
    pub salt: [u8; SALT_SIZE],
}

/// Encodes the fixed-size greeting block.
pub fn encode_greeting(version: &str, uuid: &Uuid, salt: &[u8; SALT_SIZE]) -> [u8; GREETING_SIZE] {
    let mut block = [b' '; GREETING_SIZE];
    let line1 = format!("Marlin {version} (Binary) {uuid}");
    let line2 = BASE64.encode(salt);
    let n = line1.len().min(LINE_SIZE - 1);
    block[..n].copy_from_slice(&line1.as_bytes()[..n]);
    block[LINE_SIZE - 1] = b'\n';
    let n = line2.len().min(LINE_SIZE - 1);
    block[LINE_SIZE..LINE_SIZE + n].copy_from_slice(&line2.as_bytes()[..n]);
    block[GREETING_SIZE - 1] = b'\n';
    block
}

/// Decodes a greeting block received from a server.
pub fn decode_greeting(block: &[u8]) -> Result<Greeting, ProtocolError> {
    if block.len() != GREETING_SIZE {
        return Err(ProtocolError::BadGreeting);
    }
    let line1 = std::str::from_utf8(&block[..LINE_SIZE]).map_err(|_| ProtocolError::BadGreeting)?;
    let line2 = std::str::from_utf8(&block[LINE_SIZE..]).map_err(|_| ProtocolError::BadGreeting)?;

    let mut words = line1.split_whitespace();
    if words.next() != Some("Marlin") {
        return Err(ProtocolError::BadGreeting);
    }
    let version = words.next().ok_or(ProtocolError::BadGreeting)?.to_string();
    if words.next() != Some("(Binary)") {
        return Err(ProtocolError::BadGreeting);
    }
    let uuid = words
        .next()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(ProtocolError::BadGreeting)?;

    let decoded = BASE64
        .decode(line2.trim())
        .map_err(|_| ProtocolError::BadGreeting)?;
    if decoded.len() < SALT_SIZE {
        return Err(ProtocolError::BadGreeting);
    }
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&decoded[..SALT_SIZE]);

    Ok(Greeting {
        version,
        uuid,
        salt,
    })
}
