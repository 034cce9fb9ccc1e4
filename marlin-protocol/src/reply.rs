//! Response encoding and decoding.
//!
//! Responses use the same frame layout as requests. The header `CODE` is 0
//! for OK or `ERROR_TYPE_BIT | error_code` for failures; every response
//! echoes the request sync and carries the server's current schema version.
//! The length prefix is always the fixed 5-byte form so a reply can be
//! sized before its body is known.

use crate::error::{ClientError, ErrorCode, ProtocolError};
use crate::request::field;
use crate::ERROR_TYPE_BIT;
use bytes::Bytes;
use rmpv::Value;

enum ReplyBody<'a> {
    Empty,
    Data(&'a [Value]),
    Error(&'a str),
}

fn encode_reply(code: u32, sync: u64, schema_version: u64, body: ReplyBody<'_>) -> Bytes {
    fn inner(
        code: u32,
        sync: u64,
        schema_version: u64,
        body: ReplyBody<'_>,
    ) -> Result<Vec<u8>, std::io::Error> {
        let mut payload = Vec::with_capacity(64);
        rmp::encode::write_map_len(&mut payload, 3).map_err(std::io::Error::other)?;
        rmp::encode::write_uint(&mut payload, field::REQUEST_TYPE).map_err(std::io::Error::other)?;
        rmp::encode::write_uint(&mut payload, code as u64).map_err(std::io::Error::other)?;
        rmp::encode::write_uint(&mut payload, field::SYNC).map_err(std::io::Error::other)?;
        rmp::encode::write_uint(&mut payload, sync).map_err(std::io::Error::other)?;
        rmp::encode::write_uint(&mut payload, field::SCHEMA_VERSION)
            .map_err(std::io::Error::other)?;
        rmp::encode::write_uint(&mut payload, schema_version).map_err(std::io::Error::other)?;
        match body {
            ReplyBody::Empty => {
                rmp::encode::write_map_len(&mut payload, 0).map_err(std::io::Error::other)?;
            }
            ReplyBody::Data(tuples) => {
                rmp::encode::write_map_len(&mut payload, 1).map_err(std::io::Error::other)?;
                rmp::encode::write_uint(&mut payload, field::DATA).map_err(std::io::Error::other)?;
                rmp::encode::write_array_len(&mut payload, tuples.len() as u32)
                    .map_err(std::io::Error::other)?;
                for tuple in tuples {
                    rmpv::encode::write_value(&mut payload, tuple)
                        .map_err(std::io::Error::other)?;
                }
            }
            ReplyBody::Error(message) => {
                rmp::encode::write_map_len(&mut payload, 1).map_err(std::io::Error::other)?;
                rmp::encode::write_uint(&mut payload, field::ERROR)
                    .map_err(std::io::Error::other)?;
                rmp::encode::write_str(&mut payload, message).map_err(std::io::Error::other)?;
            }
        }
        // Fixed 5-byte length prefix.
        let mut out = Vec::with_capacity(payload.len() + 5);
        out.push(0xce);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }
    // Writes go to a Vec and cannot fail.
    Bytes::from(inner(code, sync, schema_version, body).expect("reply encoding"))
}

/// Encodes an OK response with an empty body.
pub fn encode_ok(sync: u64, schema_version: u64) -> Bytes {
    encode_reply(0, sync, schema_version, ReplyBody::Empty)
}

/// Encodes an error response carrying the numeric code and message.
pub fn encode_error(sync: u64, schema_version: u64, error: &ClientError) -> Bytes {
    encode_reply(
        ERROR_TYPE_BIT | error.code.code(),
        sync,
        schema_version,
        ReplyBody::Error(&error.message),
    )
}

/// Encodes an OK response whose body is a `DATA` array of tuples.
pub fn encode_data(sync: u64, schema_version: u64, tuples: &[Value]) -> Bytes {
    encode_reply(0, sync, schema_version, ReplyBody::Data(tuples))
}

/// A decoded response.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub code: u32,
    pub sync: u64,
    pub schema_version: u64,
    pub data: Option<Vec<Value>>,
    pub error: Option<String>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// The error code of a failed response.
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.is_ok() {
            None
        } else {
            Some(ErrorCode::from_code(self.code & !ERROR_TYPE_BIT))
        }
    }
}

/// Decodes a response from a frame payload (header and optional body).
pub fn decode_response(payload: &[u8]) -> Result<Response, ProtocolError> {
    let mut rd = payload;
    let n = rmp::decode::read_map_len(&mut rd)
        .map_err(|_| ProtocolError::InvalidMsgpack("response header"))?;
    let mut response = Response::default();
    for _ in 0..n {
        let key = rmp::decode::read_int::<u64, _>(&mut rd)
            .map_err(|_| ProtocolError::InvalidMsgpack("response header key"))?;
        let value = |rd: &mut &[u8]| {
            rmp::decode::read_int::<u64, _>(rd)
                .map_err(|_| ProtocolError::InvalidMsgpack("response header"))
        };
        match key {
            field::REQUEST_TYPE => response.code = value(&mut rd)? as u32,
            field::SYNC => response.sync = value(&mut rd)?,
            field::SCHEMA_VERSION => response.schema_version = value(&mut rd)?,
            _ => {
                rmpv::decode::read_value(&mut rd)
                    .map_err(|_| ProtocolError::InvalidMsgpack("response header"))?;
            }
        }
    }
    if !rd.is_empty() {
        let n = rmp::decode::read_map_len(&mut rd)
            .map_err(|_| ProtocolError::InvalidMsgpack("response body"))?;
        for _ in 0..n {
            let key = rmp::decode::read_int::<u64, _>(&mut rd)
                .map_err(|_| ProtocolError::InvalidMsgpack("response body key"))?;
            let value = rmpv::decode::read_value(&mut rd)
                .map_err(|_| ProtocolError::InvalidMsgpack("response body"))?;
            match (key, value) {
                (field::DATA, Value::Array(tuples)) => response.data = Some(tuples),
                (field::ERROR, Value::String(s)) => {
                    response.error = s.into_str();
                }
                _ => {}
            }
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_packet_len, FrameCheck};

    fn payload(frame: &[u8]) -> &[u8] {
        match read_packet_len(frame).unwrap() {
            FrameCheck::Frame { len, prefix } => &frame[prefix..prefix + len],
            FrameCheck::Incomplete => panic!("incomplete frame"),
        }
    }

    #[test]
    fn test_ok_roundtrip() {
        let frame = encode_ok(0x1234, 7);
        let response = decode_response(payload(&frame)).unwrap();
        assert!(response.is_ok());
        assert_eq!(response.sync, 0x1234);
        assert_eq!(response.schema_version, 7);
        assert!(response.data.is_none());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_error_roundtrip() {
        let err = ClientError::new(ErrorCode::WrongSchemaVersion, "wrong schema version");
        let frame = encode_error(42, 3, &err);
        let response = decode_response(payload(&frame)).unwrap();
        assert!(!response.is_ok());
        assert_eq!(response.error_code(), Some(ErrorCode::WrongSchemaVersion));
        assert_eq!(response.sync, 42);
        assert_eq!(response.error.as_deref(), Some("wrong schema version"));
    }

    #[test]
    fn test_data_roundtrip() {
        let tuples = vec![
            Value::Array(vec![Value::from(1u64), Value::from("a")]),
            Value::Array(vec![Value::from(2u64), Value::from("b")]),
        ];
        let frame = encode_data(5, 1, &tuples);
        let response = decode_response(payload(&frame)).unwrap();
        assert!(response.is_ok());
        assert_eq!(response.data.as_ref().unwrap().len(), 2);
        assert_eq!(response.data.unwrap()[1], tuples[1]);
    }

    #[test]
    fn test_empty_data() {
        let frame = encode_data(1, 1, &[]);
        let response = decode_response(payload(&frame)).unwrap();
        assert_eq!(response.data.unwrap().len(), 0);
    }

    #[test]
    fn test_fixed_length_prefix() {
        let frame = encode_ok(0, 0);
        assert_eq!(frame[0], 0xce);
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(frame.len(), 5 + len);
    }
}
