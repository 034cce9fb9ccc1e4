//! High-level client operations.

use crate::connection::Connection;
use crate::error::ClientError;
use marlin_protocol::request::field;
use marlin_protocol::{RequestType, Response};
use rmpv::Value;
use std::net::SocketAddr;

/// A request/response client over one connection.
pub struct Client {
    conn: Connection,
}

/// Verifies sync correlation and turns error frames into `ClientError`.
pub(crate) fn check_response(sync: u64, response: Response) -> Result<Response, ClientError> {
    if response.sync != sync {
        return Err(ClientError::SyncMismatch {
            expected: sync,
            got: response.sync,
        });
    }
    if let Some(code) = response.error_code() {
        return Err(ClientError::Server {
            code,
            message: response.error.unwrap_or_default(),
        });
    }
    Ok(response)
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Connection::connect(addr).await?,
        })
    }

    /// The underlying connection, for pipelined or raw exchanges.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    async fn round_trip(
        &mut self,
        request_type: RequestType,
        body: &[(u64, Value)],
    ) -> Result<Response, ClientError> {
        let sync = self.conn.send(request_type, body).await?;
        let response = self.conn.read_response().await?;
        check_response(sync, response)
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.round_trip(RequestType::Ping, &[]).await.map(|_| ())
    }

    pub async fn select(&mut self, space_id: u32, key: Value) -> Result<Vec<Value>, ClientError> {
        let response = self
            .round_trip(
                RequestType::Select,
                &[
                    (field::SPACE_ID, Value::from(space_id)),
                    (field::INDEX_ID, Value::from(0u32)),
                    (field::LIMIT, Value::from(u32::MAX)),
                    (field::OFFSET, Value::from(0u32)),
                    (field::ITERATOR, Value::from(0u32)),
                    (field::KEY, key),
                ],
            )
            .await?;
        Ok(response.data.unwrap_or_default())
    }

    pub async fn insert(&mut self, space_id: u32, tuple: Value) -> Result<Option<Value>, ClientError> {
        let response = self
            .round_trip(
                RequestType::Insert,
                &[
                    (field::SPACE_ID, Value::from(space_id)),
                    (field::TUPLE, tuple),
                ],
            )
            .await?;
        Ok(response.data.and_then(|mut tuples| {
            if tuples.is_empty() {
                None
            } else {
                Some(tuples.remove(0))
            }
        }))
    }

    pub async fn replace(
        &mut self,
        space_id: u32,
        tuple: Value,
    ) -> Result<Option<Value>, ClientError> {
        let response = self
            .round_trip(
                RequestType::Replace,
                &[
                    (field::SPACE_ID, Value::from(space_id)),
                    (field::TUPLE, tuple),
                ],
            )
            .await?;
        Ok(response.data.and_then(|mut tuples| {
            if tuples.is_empty() {
                None
            } else {
                Some(tuples.remove(0))
            }
        }))
    }

    pub async fn delete(&mut self, space_id: u32, key: Value) -> Result<Option<Value>, ClientError> {
        let response = self
            .round_trip(
                RequestType::Delete,
                &[(field::SPACE_ID, Value::from(space_id)), (field::KEY, key)],
            )
            .await?;
        Ok(response.data.and_then(|mut tuples| {
            if tuples.is_empty() {
                None
            } else {
                Some(tuples.remove(0))
            }
        }))
    }

    pub async fn call(&mut self, function: &str, args: Value) -> Result<Vec<Value>, ClientError> {
        let response = self
            .round_trip(
                RequestType::Call,
                &[
                    (field::FUNCTION_NAME, Value::from(function)),
                    (field::TUPLE, args),
                ],
            )
            .await?;
        Ok(response.data.unwrap_or_default())
    }

    pub async fn auth(&mut self, user: &str, scramble: Value) -> Result<(), ClientError> {
        self.round_trip(
            RequestType::Auth,
            &[
                (field::USER_NAME, Value::from(user)),
                (field::TUPLE, scramble),
            ],
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marlin_protocol::{ErrorCode, ERROR_TYPE_BIT};

    #[test]
    fn test_check_response_ok() {
        let response = Response {
            code: 0,
            sync: 7,
            ..Response::default()
        };
        assert!(check_response(7, response).is_ok());
    }

    #[test]
    fn test_check_response_sync_mismatch() {
        let response = Response {
            code: 0,
            sync: 8,
            ..Response::default()
        };
        let err = check_response(7, response).unwrap_err();
        assert!(matches!(
            err,
            ClientError::SyncMismatch {
                expected: 7,
                got: 8
            }
        ));
    }

    #[test]
    fn test_check_response_error_frame() {
        let response = Response {
            code: ERROR_TYPE_BIT | ErrorCode::NoSuchSpace.code(),
            sync: 7,
            error: Some("no such space 99".into()),
            ..Response::default()
        };
        let err = check_response(7, response).unwrap_err();
        match err {
            ClientError::Server { code, message } => {
                assert_eq!(code, ErrorCode::NoSuchSpace);
                assert!(message.contains("99"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
