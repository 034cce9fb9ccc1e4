//! Request decoding and encoding.
//!
//! A request frame is `<length> <header map> <body map>`. The header map
//! uses the integer keys in [`field`]; the body layout depends on the
//! request type. DML, call, eval and auth bodies are decoded eagerly into
//! typed structs; join and subscribe bodies are carried raw because the
//! replication handler owns their interpretation.

use crate::error::{ClientError, ErrorCode, ProtocolError};
use crate::frame::write_packet_len;
use rmpv::Value;
use std::fmt;
use std::io;

/// Integer keys of the header and body maps.
pub mod field {
    pub const REQUEST_TYPE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const SCHEMA_VERSION: u64 = 0x05;
    pub const SPACE_ID: u64 = 0x10;
    pub const INDEX_ID: u64 = 0x11;
    pub const LIMIT: u64 = 0x12;
    pub const OFFSET: u64 = 0x13;
    pub const ITERATOR: u64 = 0x14;
    pub const KEY: u64 = 0x20;
    pub const TUPLE: u64 = 0x21;
    pub const FUNCTION_NAME: u64 = 0x22;
    pub const USER_NAME: u64 = 0x23;
    pub const EXPR: u64 = 0x27;
    pub const OPS: u64 = 0x28;
    pub const DATA: u64 = 0x30;
    pub const ERROR: u64 = 0x31;
}

/// Request type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestType {
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    Call16 = 6,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    Call = 10,
    Ping = 64,
    Join = 65,
    Subscribe = 66,
}

impl RequestType {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => RequestType::Select,
            2 => RequestType::Insert,
            3 => RequestType::Replace,
            4 => RequestType::Update,
            5 => RequestType::Delete,
            6 => RequestType::Call16,
            7 => RequestType::Auth,
            8 => RequestType::Eval,
            9 => RequestType::Upsert,
            10 => RequestType::Call,
            64 => RequestType::Ping,
            65 => RequestType::Join,
            66 => RequestType::Subscribe,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Point DML operations (everything DML except SELECT).
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            RequestType::Insert
                | RequestType::Replace
                | RequestType::Update
                | RequestType::Delete
                | RequestType::Upsert
        )
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::Select => "SELECT",
            RequestType::Insert => "INSERT",
            RequestType::Replace => "REPLACE",
            RequestType::Update => "UPDATE",
            RequestType::Delete => "DELETE",
            RequestType::Call16 => "CALL_16",
            RequestType::Auth => "AUTH",
            RequestType::Eval => "EVAL",
            RequestType::Upsert => "UPSERT",
            RequestType::Call => "CALL",
            RequestType::Ping => "PING",
            RequestType::Join => "JOIN",
            RequestType::Subscribe => "SUBSCRIBE",
        };
        f.write_str(name)
    }
}

/// Decoded request header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestHeader {
    /// Request type code.
    pub code: u32,
    /// Client-chosen request id, echoed in the response.
    pub sync: u64,
    /// Client's view of the schema version; 0 means "don't check".
    pub schema_version: u64,
}

impl RequestHeader {
    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_code(self.code)
    }
}

/// A DML request body (SELECT and all point operations).
#[derive(Debug, Clone)]
pub struct DmlRequest {
    pub space_id: u32,
    pub index_id: u32,
    pub limit: u32,
    pub offset: u32,
    pub iterator: u32,
    pub key: Value,
    pub tuple: Option<Value>,
    pub ops: Option<Value>,
}

impl Default for DmlRequest {
    fn default() -> Self {
        Self {
            space_id: 0,
            index_id: 0,
            limit: 0,
            offset: 0,
            iterator: 0,
            key: Value::Nil,
            tuple: None,
            ops: None,
        }
    }
}

/// A CALL/CALL_16/EVAL request body.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub function: Option<String>,
    pub expr: Option<String>,
    pub args: Value,
}

impl Default for CallRequest {
    fn default() -> Self {
        Self {
            function: None,
            expr: None,
            args: Value::Nil,
        }
    }
}

/// An AUTH request body.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub user: String,
    pub scramble: Value,
}

/// Decoded request body, one variant per opcode family.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Dml(DmlRequest),
    Call(CallRequest),
    Auth(AuthRequest),
    Ping,
    Join { body: Vec<u8> },
    Subscribe { body: Vec<u8> },
}

fn read_uint(rd: &mut &[u8], what: &'static str) -> Result<u64, ProtocolError> {
    rmp::decode::read_int::<u64, _>(rd).map_err(|_| ProtocolError::InvalidMsgpack(what))
}

fn read_map_len(rd: &mut &[u8], what: &'static str) -> Result<u32, ProtocolError> {
    rmp::decode::read_map_len(rd).map_err(|_| ProtocolError::InvalidMsgpack(what))
}

fn read_value(rd: &mut &[u8], what: &'static str) -> Result<Value, ProtocolError> {
    rmpv::decode::read_value(rd).map_err(|_| ProtocolError::InvalidMsgpack(what))
}

fn read_str(rd: &mut &[u8], what: &'static str) -> Result<String, ProtocolError> {
    match read_value(rd, what)? {
        Value::String(s) => s.into_str().ok_or(ProtocolError::InvalidMsgpack(what)),
        _ => Err(ProtocolError::InvalidMsgpack(what)),
    }
}

/// Decodes a request header from the front of a frame payload.
pub fn decode_header(rd: &mut &[u8]) -> Result<RequestHeader, ProtocolError> {
    let n = read_map_len(rd, "request header")?;
    let mut header = RequestHeader::default();
    for _ in 0..n {
        let key = read_uint(rd, "request header key")?;
        match key {
            field::REQUEST_TYPE => header.code = read_uint(rd, "request type")? as u32,
            field::SYNC => header.sync = read_uint(rd, "sync")?,
            field::SCHEMA_VERSION => {
                header.schema_version = read_uint(rd, "schema version")?;
            }
            _ => {
                read_value(rd, "request header")?;
            }
        }
    }
    Ok(header)
}

fn decode_dml(request_type: RequestType, rd: &mut &[u8]) -> Result<DmlRequest, ProtocolError> {
    let n = read_map_len(rd, "request body")?;
    let mut req = DmlRequest {
        key: Value::Array(Vec::new()),
        ..DmlRequest::default()
    };
    let mut has_space = false;
    for _ in 0..n {
        let key = read_uint(rd, "request body key")?;
        match key {
            field::SPACE_ID => {
                req.space_id = read_uint(rd, "space id")? as u32;
                has_space = true;
            }
            field::INDEX_ID => req.index_id = read_uint(rd, "index id")? as u32,
            field::LIMIT => req.limit = read_uint(rd, "limit")? as u32,
            field::OFFSET => req.offset = read_uint(rd, "offset")? as u32,
            field::ITERATOR => req.iterator = read_uint(rd, "iterator")? as u32,
            field::KEY => req.key = read_value(rd, "key")?,
            field::TUPLE => req.tuple = Some(read_value(rd, "tuple")?),
            field::OPS => req.ops = Some(read_value(rd, "ops")?),
            _ => {
                read_value(rd, "request body")?;
            }
        }
    }
    if !has_space {
        return Err(ProtocolError::MissingField("space id"));
    }
    match request_type {
        RequestType::Insert | RequestType::Replace | RequestType::Upsert
            if req.tuple.is_none() =>
        {
            return Err(ProtocolError::MissingField("tuple"));
        }
        RequestType::Update if req.ops.is_none() => {
            return Err(ProtocolError::MissingField("ops"));
        }
        _ => {}
    }
    Ok(req)
}

fn decode_call(request_type: RequestType, rd: &mut &[u8]) -> Result<CallRequest, ProtocolError> {
    let n = read_map_len(rd, "request body")?;
    let mut req = CallRequest {
        args: Value::Array(Vec::new()),
        ..CallRequest::default()
    };
    for _ in 0..n {
        let key = read_uint(rd, "request body key")?;
        match key {
            field::FUNCTION_NAME => req.function = Some(read_str(rd, "function name")?),
            field::EXPR => req.expr = Some(read_str(rd, "expression")?),
            field::TUPLE => req.args = read_value(rd, "call arguments")?,
            _ => {
                read_value(rd, "request body")?;
            }
        }
    }
    if request_type == RequestType::Eval {
        if req.expr.is_none() {
            return Err(ProtocolError::MissingField("expression"));
        }
    } else if req.function.is_none() {
        return Err(ProtocolError::MissingField("function name"));
    }
    Ok(req)
}

fn decode_auth(rd: &mut &[u8]) -> Result<AuthRequest, ProtocolError> {
    let n = read_map_len(rd, "request body")?;
    let mut user = None;
    let mut scramble = Value::Array(Vec::new());
    for _ in 0..n {
        let key = read_uint(rd, "request body key")?;
        match key {
            field::USER_NAME => user = Some(read_str(rd, "user name")?),
            field::TUPLE => scramble = read_value(rd, "auth scramble")?,
            _ => {
                read_value(rd, "request body")?;
            }
        }
    }
    Ok(AuthRequest {
        user: user.ok_or(ProtocolError::MissingField("user name"))?,
        scramble,
    })
}

/// Decodes the body of a request whose header is already known.
///
/// `body` is the remainder of the frame payload after the header map.
pub fn decode_request(header: &RequestHeader, body: &[u8]) -> Result<RequestBody, ClientError> {
    let Some(request_type) = header.request_type() else {
        return Err(ClientError::new(
            ErrorCode::UnknownRequestType,
            format!("unknown request type {}", header.code),
        ));
    };
    let mut rd = body;
    let decoded = match request_type {
        RequestType::Select
        | RequestType::Insert
        | RequestType::Replace
        | RequestType::Update
        | RequestType::Delete
        | RequestType::Upsert => RequestBody::Dml(decode_dml(request_type, &mut rd)?),
        RequestType::Call | RequestType::Call16 | RequestType::Eval => {
            RequestBody::Call(decode_call(request_type, &mut rd)?)
        }
        RequestType::Auth => RequestBody::Auth(decode_auth(&mut rd)?),
        RequestType::Ping => RequestBody::Ping,
        RequestType::Join => RequestBody::Join {
            body: body.to_vec(),
        },
        RequestType::Subscribe => RequestBody::Subscribe {
            body: body.to_vec(),
        },
    };
    Ok(decoded)
}

fn wio<E: std::error::Error + Send + Sync + 'static>(e: E) -> ProtocolError {
    ProtocolError::Io(io::Error::other(e))
}

/// Encodes a complete request frame: length prefix, header, body map.
///
/// `SCHEMA_VERSION` is written only when non-zero, matching what clients
/// send by default.
pub fn encode_request(
    request_type: RequestType,
    sync: u64,
    schema_version: u64,
    body: &[(u64, Value)],
) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = Vec::with_capacity(64);
    let header_fields = if schema_version != 0 { 3 } else { 2 };
    rmp::encode::write_map_len(&mut payload, header_fields).map_err(wio)?;
    rmp::encode::write_uint(&mut payload, field::REQUEST_TYPE).map_err(wio)?;
    rmp::encode::write_uint(&mut payload, request_type.code() as u64).map_err(wio)?;
    rmp::encode::write_uint(&mut payload, field::SYNC).map_err(wio)?;
    rmp::encode::write_uint(&mut payload, sync).map_err(wio)?;
    if schema_version != 0 {
        rmp::encode::write_uint(&mut payload, field::SCHEMA_VERSION).map_err(wio)?;
        rmp::encode::write_uint(&mut payload, schema_version).map_err(wio)?;
    }
    rmp::encode::write_map_len(&mut payload, body.len() as u32).map_err(wio)?;
    for (key, value) in body {
        rmp::encode::write_uint(&mut payload, *key).map_err(wio)?;
        rmpv::encode::write_value(&mut payload, value).map_err(wio)?;
    }
    let mut out = Vec::with_capacity(payload.len() + 5);
    write_packet_len(&mut out, payload.len());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_packet_len, FrameCheck};

    fn frame_payload(frame: &[u8]) -> &[u8] {
        match read_packet_len(frame).unwrap() {
            FrameCheck::Frame { len, prefix } => &frame[prefix..prefix + len],
            FrameCheck::Incomplete => panic!("incomplete frame"),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let frame = encode_request(RequestType::Ping, 0x1234, 0, &[]).unwrap();
        let mut rd = frame_payload(&frame);
        let header = decode_header(&mut rd).unwrap();
        assert_eq!(header.code, RequestType::Ping.code());
        assert_eq!(header.sync, 0x1234);
        assert_eq!(header.schema_version, 0);
    }

    #[test]
    fn test_header_with_schema_version() {
        let frame = encode_request(RequestType::Insert, 7, 999, &[]).unwrap();
        let mut rd = frame_payload(&frame);
        let header = decode_header(&mut rd).unwrap();
        assert_eq!(header.schema_version, 999);
    }

    #[test]
    fn test_select_roundtrip() {
        let key = Value::Array(vec![Value::from(42u64)]);
        let frame = encode_request(
            RequestType::Select,
            1,
            0,
            &[
                (field::SPACE_ID, Value::from(512u64)),
                (field::INDEX_ID, Value::from(0u64)),
                (field::LIMIT, Value::from(100u64)),
                (field::ITERATOR, Value::from(0u64)),
                (field::KEY, key.clone()),
            ],
        )
        .unwrap();
        let mut rd = frame_payload(&frame);
        let header = decode_header(&mut rd).unwrap();
        let body = decode_request(&header, rd).unwrap();
        match body {
            RequestBody::Dml(dml) => {
                assert_eq!(dml.space_id, 512);
                assert_eq!(dml.limit, 100);
                assert_eq!(dml.key, key);
                assert!(dml.tuple.is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_insert_requires_tuple() {
        let frame = encode_request(
            RequestType::Insert,
            1,
            0,
            &[(field::SPACE_ID, Value::from(512u64))],
        )
        .unwrap();
        let mut rd = frame_payload(&frame);
        let header = decode_header(&mut rd).unwrap();
        let err = decode_request(&header, rd).unwrap_err();
        assert_eq!(err.code, ErrorCode::IllegalParams);
        assert!(err.message.contains("tuple"));
    }

    #[test]
    fn test_dml_requires_space_id() {
        let frame = encode_request(
            RequestType::Delete,
            1,
            0,
            &[(field::KEY, Value::Array(vec![Value::from(1u64)]))],
        )
        .unwrap();
        let mut rd = frame_payload(&frame);
        let header = decode_header(&mut rd).unwrap();
        let err = decode_request(&header, rd).unwrap_err();
        assert_eq!(err.code, ErrorCode::IllegalParams);
    }

    #[test]
    fn test_call_roundtrip() {
        let frame = encode_request(
            RequestType::Call,
            9,
            0,
            &[
                (field::FUNCTION_NAME, Value::from("echo")),
                (field::TUPLE, Value::Array(vec![Value::from("hi")])),
            ],
        )
        .unwrap();
        let mut rd = frame_payload(&frame);
        let header = decode_header(&mut rd).unwrap();
        match decode_request(&header, rd).unwrap() {
            RequestBody::Call(call) => {
                assert_eq!(call.function.as_deref(), Some("echo"));
                assert_eq!(call.args.as_array().unwrap().len(), 1);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_auth_roundtrip() {
        let frame = encode_request(
            RequestType::Auth,
            3,
            0,
            &[
                (field::USER_NAME, Value::from("guest")),
                (field::TUPLE, Value::Array(vec![])),
            ],
        )
        .unwrap();
        let mut rd = frame_payload(&frame);
        let header = decode_header(&mut rd).unwrap();
        match decode_request(&header, rd).unwrap() {
            RequestBody::Auth(auth) => assert_eq!(auth.user, "guest"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_frame_reencode_identity() {
        // Decoding a frame and re-encoding the result reproduces it
        // byte for byte.
        let body = [
            (field::SPACE_ID, Value::from(512u64)),
            (field::INDEX_ID, Value::from(0u64)),
            (field::LIMIT, Value::from(10u64)),
            (field::OFFSET, Value::from(0u64)),
            (field::ITERATOR, Value::from(0u64)),
            (field::KEY, Value::Array(vec![Value::from(7u64)])),
        ];
        let frame = encode_request(RequestType::Select, 99, 0, &body).unwrap();

        let mut rd = frame_payload(&frame);
        let header = decode_header(&mut rd).unwrap();
        let RequestBody::Dml(dml) = decode_request(&header, rd).unwrap() else {
            panic!("not a dml body");
        };

        let reencoded = encode_request(
            header.request_type().unwrap(),
            header.sync,
            header.schema_version,
            &[
                (field::SPACE_ID, Value::from(dml.space_id as u64)),
                (field::INDEX_ID, Value::from(dml.index_id as u64)),
                (field::LIMIT, Value::from(dml.limit as u64)),
                (field::OFFSET, Value::from(dml.offset as u64)),
                (field::ITERATOR, Value::from(dml.iterator as u64)),
                (field::KEY, dml.key),
            ],
        )
        .unwrap();
        assert_eq!(frame, reencoded);
    }

    #[test]
    fn test_unknown_request_type() {
        let header = RequestHeader {
            code: 250,
            sync: 1,
            schema_version: 0,
        };
        let err = decode_request(&header, &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownRequestType);
    }

    #[test]
    fn test_unknown_header_key_is_skipped() {
        let mut payload = Vec::new();
        rmp::encode::write_map_len(&mut payload, 3).unwrap();
        rmp::encode::write_uint(&mut payload, field::REQUEST_TYPE).unwrap();
        rmp::encode::write_uint(&mut payload, 64).unwrap();
        rmp::encode::write_uint(&mut payload, 0x7f).unwrap();
        rmp::encode::write_str(&mut payload, "future extension").unwrap();
        rmp::encode::write_uint(&mut payload, field::SYNC).unwrap();
        rmp::encode::write_uint(&mut payload, 5).unwrap();

        let mut rd = &payload[..];
        let header = decode_header(&mut rd).unwrap();
        assert_eq!(header.sync, 5);
        assert_eq!(header.code, 64);
    }

    #[test]
    fn test_garbage_header_is_invalid() {
        let mut rd = &[0xc1u8, 0x00][..];
        assert!(decode_header(&mut rd).is_err());
    }
}
