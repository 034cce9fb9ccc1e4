//! The transaction processor boundary.
//!
//! The front-end treats request semantics as an external service: every
//! opcode family maps to one callback on [`RequestProcessor`]. Handlers run
//! on the TX context's thread, one connection at a time, and either return
//! response data, raise a typed [`ClientError`] (serialized into an error
//! frame in place), or take over the socket for the duration of a
//! replication stream.

use crate::session::Session;
use marlin_protocol::{
    AuthRequest, CallRequest, ClientError, DmlRequest, ErrorCode, RequestHeader, RequestType,
};
use rmpv::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// The client socket, on loan to a JOIN/SUBSCRIBE handler.
///
/// While the handler runs, the NET context keeps both watchers disarmed;
/// the handler is the only owner of the file descriptor.
pub struct ReplicaLink {
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
}

/// Failure of a replication handler.
///
/// Socket errors must not be answered over the same socket; they propagate
/// and close the connection. Anything else is reported to the client as an
/// error frame.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// The opaque transaction processor.
///
/// Implementations run on the TX thread and need not be `Sync`; requests of
/// one connection are delivered strictly in arrival order.
pub trait RequestProcessor: Send + 'static {
    /// The current schema version, echoed in every response header and
    /// checked against non-zero request headers.
    fn schema_version(&self) -> u64;

    /// Runs after the session is created, before the greeting is sent.
    /// An error closes the connection after a best-effort error reply.
    fn on_connect(&self, session: &Session) -> impl Future<Output = Result<(), ClientError>>;

    /// Runs while the session is destroyed.
    fn on_disconnect(&self, session: &Session) -> impl Future<Output = ()>;

    /// Point DML: INSERT/REPLACE/UPDATE/DELETE/UPSERT. Returns the affected
    /// tuple, if any, for the response `DATA` array.
    fn process_dml(
        &self,
        request_type: RequestType,
        request: &DmlRequest,
        session: &Session,
    ) -> impl Future<Output = Result<Option<Value>, ClientError>>;

    fn process_select(
        &self,
        request: &DmlRequest,
        session: &Session,
    ) -> impl Future<Output = Result<Vec<Value>, ClientError>>;

    fn process_call(
        &self,
        request: &CallRequest,
        session: &Session,
    ) -> impl Future<Output = Result<Vec<Value>, ClientError>>;

    fn process_eval(
        &self,
        request: &CallRequest,
        session: &Session,
    ) -> impl Future<Output = Result<Vec<Value>, ClientError>>;

    fn process_auth(
        &self,
        request: &AuthRequest,
        session: &Session,
    ) -> impl Future<Output = Result<(), ClientError>>;

    /// Streams an initial snapshot to a joining replica. Owns the socket
    /// until it returns; input resumes afterwards.
    fn process_join(
        &self,
        link: &mut ReplicaLink,
        header: &RequestHeader,
        body: &[u8],
        session: &Session,
    ) -> impl Future<Output = Result<(), ProcessError>>;

    /// Streams changes to a subscribed replica. Returns only on error or
    /// stream end; the connection closes afterwards.
    fn process_subscribe(
        &self,
        link: &mut ReplicaLink,
        header: &RequestHeader,
        body: &[u8],
        session: &Session,
    ) -> impl Future<Output = Result<(), ProcessError>>;
}

/// A small in-memory processor backing the server binary and the tests.
///
/// Spaces are created implicitly on first insert; the primary key is the
/// first tuple field. Creating a space bumps the schema version, the way a
/// real DDL change would.
pub struct MemoryProcessor {
    schema_version: AtomicU64,
    spaces: RefCell<HashMap<u32, Vec<Value>>>,
}

impl MemoryProcessor {
    pub fn new() -> Self {
        Self {
            schema_version: AtomicU64::new(1),
            spaces: RefCell::new(HashMap::new()),
        }
    }
}

impl Default for MemoryProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn tuple_key(tuple: &Value) -> Option<&Value> {
    tuple.as_array().and_then(|fields| fields.first())
}

/// A key array matches a tuple when every key part equals the
/// corresponding leading tuple field. An empty key matches everything.
fn key_matches(tuple: &Value, key: &Value) -> bool {
    let (Some(fields), Some(parts)) = (tuple.as_array(), key.as_array()) else {
        return false;
    };
    parts.len() <= fields.len() && fields.iter().zip(parts).all(|(f, p)| f == p)
}

fn apply_ops(tuple: &Value, ops: &Value) -> Result<Value, ClientError> {
    let mut fields = tuple
        .as_array()
        .cloned()
        .ok_or_else(|| ClientError::new(ErrorCode::IllegalParams, "tuple is not an array"))?;
    let ops = ops
        .as_array()
        .ok_or_else(|| ClientError::new(ErrorCode::IllegalParams, "ops is not an array"))?;
    for op in ops {
        let parts = op
            .as_array()
            .filter(|p| p.len() == 3)
            .ok_or_else(|| ClientError::new(ErrorCode::IllegalParams, "malformed update op"))?;
        let name = parts[0].as_str().unwrap_or("");
        let field_no = parts[1].as_u64().unwrap_or(u64::MAX) as usize;
        let slot = fields.get_mut(field_no).ok_or_else(|| {
            ClientError::new(
                ErrorCode::IllegalParams,
                format!("update field {field_no} is out of range"),
            )
        })?;
        match name {
            "=" => *slot = parts[2].clone(),
            "+" | "-" => {
                let (Some(old), Some(arg)) = (slot.as_i64(), parts[2].as_i64()) else {
                    return Err(ClientError::new(
                        ErrorCode::IllegalParams,
                        "arithmetic update on a non-integer field",
                    ));
                };
                *slot = Value::from(if name == "+" { old + arg } else { old - arg });
            }
            other => {
                return Err(ClientError::new(
                    ErrorCode::Unsupported,
                    format!("unsupported update operation '{other}'"),
                ));
            }
        }
    }
    Ok(Value::Array(fields))
}

impl MemoryProcessor {
    fn with_space<T>(
        &self,
        space_id: u32,
        f: impl FnOnce(&mut Vec<Value>) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let mut spaces = self.spaces.borrow_mut();
        let space = spaces.get_mut(&space_id).ok_or_else(|| {
            ClientError::new(ErrorCode::NoSuchSpace, format!("no such space {space_id}"))
        })?;
        f(space)
    }
}

impl RequestProcessor for MemoryProcessor {
    fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::Relaxed)
    }

    async fn on_connect(&self, _session: &Session) -> Result<(), ClientError> {
        Ok(())
    }

    async fn on_disconnect(&self, _session: &Session) {}

    async fn process_dml(
        &self,
        request_type: RequestType,
        request: &DmlRequest,
        _session: &Session,
    ) -> Result<Option<Value>, ClientError> {
        if request.index_id != 0 {
            return Err(ClientError::new(
                ErrorCode::NoSuchIndex,
                format!("no such index {}", request.index_id),
            ));
        }
        match request_type {
            RequestType::Insert => {
                let tuple = request.tuple.clone().unwrap_or(Value::Nil);
                let key = tuple_key(&tuple)
                    .cloned()
                    .ok_or_else(|| ClientError::new(ErrorCode::IllegalParams, "empty tuple"))?;
                let mut spaces = self.spaces.borrow_mut();
                let space = spaces.entry(request.space_id).or_insert_with(|| {
                    self.schema_version.fetch_add(1, Ordering::Relaxed);
                    Vec::new()
                });
                if space.iter().any(|t| tuple_key(t) == Some(&key)) {
                    return Err(ClientError::new(
                        ErrorCode::TupleFound,
                        format!("duplicate key in space {}", request.space_id),
                    ));
                }
                space.push(tuple.clone());
                Ok(Some(tuple))
            }
            RequestType::Replace => {
                let tuple = request.tuple.clone().unwrap_or(Value::Nil);
                let key = tuple_key(&tuple)
                    .cloned()
                    .ok_or_else(|| ClientError::new(ErrorCode::IllegalParams, "empty tuple"))?;
                let mut spaces = self.spaces.borrow_mut();
                let space = spaces.entry(request.space_id).or_insert_with(|| {
                    self.schema_version.fetch_add(1, Ordering::Relaxed);
                    Vec::new()
                });
                space.retain(|t| tuple_key(t) != Some(&key));
                space.push(tuple.clone());
                Ok(Some(tuple))
            }
            RequestType::Update => self.with_space(request.space_id, |space| {
                let Some(slot) = space.iter_mut().find(|t| key_matches(t, &request.key)) else {
                    return Ok(None);
                };
                let ops = request.ops.as_ref().cloned().unwrap_or(Value::Nil);
                let updated = apply_ops(slot, &ops)?;
                *slot = updated.clone();
                Ok(Some(updated))
            }),
            RequestType::Delete => self.with_space(request.space_id, |space| {
                let pos = space.iter().position(|t| key_matches(t, &request.key));
                Ok(pos.map(|i| space.remove(i)))
            }),
            RequestType::Upsert => {
                let tuple = request.tuple.clone().unwrap_or(Value::Nil);
                let key = tuple_key(&tuple)
                    .cloned()
                    .ok_or_else(|| ClientError::new(ErrorCode::IllegalParams, "empty tuple"))?;
                let mut spaces = self.spaces.borrow_mut();
                let space = spaces.entry(request.space_id).or_insert_with(|| {
                    self.schema_version.fetch_add(1, Ordering::Relaxed);
                    Vec::new()
                });
                match space.iter_mut().find(|t| tuple_key(t) == Some(&key)) {
                    Some(slot) => {
                        let ops = request.ops.as_ref().cloned().unwrap_or(Value::Nil);
                        *slot = apply_ops(slot, &ops)?;
                    }
                    None => space.push(tuple),
                }
                // UPSERT reports no tuple back.
                Ok(None)
            }
            other => Err(ClientError::new(
                ErrorCode::Unsupported,
                format!("{other} is not a point DML operation"),
            )),
        }
    }

    async fn process_select(
        &self,
        request: &DmlRequest,
        _session: &Session,
    ) -> Result<Vec<Value>, ClientError> {
        if request.index_id != 0 {
            return Err(ClientError::new(
                ErrorCode::NoSuchIndex,
                format!("no such index {}", request.index_id),
            ));
        }
        self.with_space(request.space_id, |space| {
            Ok(space
                .iter()
                .filter(|t| key_matches(t, &request.key))
                .skip(request.offset as usize)
                .take(request.limit as usize)
                .cloned()
                .collect())
        })
    }

    async fn process_call(
        &self,
        request: &CallRequest,
        _session: &Session,
    ) -> Result<Vec<Value>, ClientError> {
        match request.function.as_deref() {
            Some("echo") => Ok(request.args.as_array().cloned().unwrap_or_default()),
            Some(name) => Err(ClientError::new(
                ErrorCode::NoSuchFunction,
                format!("no such function '{name}'"),
            )),
            None => Err(ClientError::new(
                ErrorCode::IllegalParams,
                "missing function name",
            )),
        }
    }

    async fn process_eval(
        &self,
        _request: &CallRequest,
        _session: &Session,
    ) -> Result<Vec<Value>, ClientError> {
        Err(ClientError::new(
            ErrorCode::Unsupported,
            "eval is not supported by the memory processor",
        ))
    }

    async fn process_auth(
        &self,
        request: &AuthRequest,
        session: &Session,
    ) -> Result<(), ClientError> {
        // No credential store: any user authenticates against the salt.
        session.set_user(&request.user);
        Ok(())
    }

    async fn process_join(
        &self,
        _link: &mut ReplicaLink,
        _header: &RequestHeader,
        _body: &[u8],
        _session: &Session,
    ) -> Result<(), ProcessError> {
        Err(ClientError::new(ErrorCode::Unsupported, "replication is not configured").into())
    }

    async fn process_subscribe(
        &self,
        _link: &mut ReplicaLink,
        _header: &RequestHeader,
        _body: &[u8],
        _session: &Session,
    ) -> Result<(), ProcessError> {
        Err(ClientError::new(ErrorCode::Unsupported, "replication is not configured").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("127.0.0.1:1000".parse().unwrap())
    }

    fn tuple(fields: &[i64]) -> Value {
        Value::Array(fields.iter().map(|&f| Value::from(f)).collect())
    }

    fn select_all(space_id: u32) -> DmlRequest {
        DmlRequest {
            space_id,
            limit: u32::MAX,
            key: Value::Array(vec![]),
            ..DmlRequest::default()
        }
    }

    async fn insert(px: &MemoryProcessor, space_id: u32, fields: &[i64]) {
        let request = DmlRequest {
            space_id,
            tuple: Some(tuple(fields)),
            ..DmlRequest::default()
        };
        px.process_dml(RequestType::Insert, &request, &session())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_select() {
        let px = MemoryProcessor::new();
        insert(&px, 512, &[1, 10]).await;
        insert(&px, 512, &[2, 20]).await;

        let rows = px.process_select(&select_all(512), &session()).await.unwrap();
        assert_eq!(rows.len(), 2);

        let mut by_key = select_all(512);
        by_key.key = Value::Array(vec![Value::from(2)]);
        let rows = px.process_select(&by_key, &session()).await.unwrap();
        assert_eq!(rows, vec![tuple(&[2, 20])]);
    }

    #[tokio::test]
    async fn test_duplicate_insert() {
        let px = MemoryProcessor::new();
        insert(&px, 512, &[1, 10]).await;
        let request = DmlRequest {
            space_id: 512,
            tuple: Some(tuple(&[1, 99])),
            ..DmlRequest::default()
        };
        let err = px
            .process_dml(RequestType::Insert, &request, &session())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TupleFound);
    }

    #[tokio::test]
    async fn test_select_missing_space() {
        let px = MemoryProcessor::new();
        let err = px
            .process_select(&select_all(99), &session())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSuchSpace);
    }

    #[tokio::test]
    async fn test_update_ops() {
        let px = MemoryProcessor::new();
        insert(&px, 512, &[1, 10]).await;
        let request = DmlRequest {
            space_id: 512,
            key: Value::Array(vec![Value::from(1)]),
            ops: Some(Value::Array(vec![Value::Array(vec![
                Value::from("+"),
                Value::from(1u64),
                Value::from(5),
            ])])),
            ..DmlRequest::default()
        };
        let updated = px
            .process_dml(RequestType::Update, &request, &session())
            .await
            .unwrap();
        assert_eq!(updated, Some(tuple(&[1, 15])));
    }

    #[tokio::test]
    async fn test_delete() {
        let px = MemoryProcessor::new();
        insert(&px, 512, &[1, 10]).await;
        let request = DmlRequest {
            space_id: 512,
            key: Value::Array(vec![Value::from(1)]),
            ..DmlRequest::default()
        };
        let removed = px
            .process_dml(RequestType::Delete, &request, &session())
            .await
            .unwrap();
        assert_eq!(removed, Some(tuple(&[1, 10])));
        let rows = px.process_select(&select_all(512), &session()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_schema_version_bumps_on_space_creation() {
        let px = MemoryProcessor::new();
        let before = px.schema_version();
        insert(&px, 512, &[1]).await;
        assert!(px.schema_version() > before);
        insert(&px, 512, &[2]).await;
        // Same space: no further bump.
        assert_eq!(px.schema_version(), before + 1);
    }

    #[tokio::test]
    async fn test_call_echo() {
        let px = MemoryProcessor::new();
        let request = CallRequest {
            function: Some("echo".into()),
            args: Value::Array(vec![Value::from("hi")]),
            ..CallRequest::default()
        };
        let out = px.process_call(&request, &session()).await.unwrap();
        assert_eq!(out, vec![Value::from("hi")]);

        let request = CallRequest {
            function: Some("nope".into()),
            ..CallRequest::default()
        };
        let err = px.process_call(&request, &session()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSuchFunction);
    }
}
