//! Connection management.
//!
//! A connection reads the 128-byte greeting on connect, then exchanges
//! length-prefixed frames. Requests may be pipelined freely; responses are
//! read back in server order and correlated by sync.

use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use marlin_protocol::{
    decode_greeting, decode_response, encode_request, read_packet_len, FrameCheck, Greeting,
    RequestType, Response, GREETING_SIZE,
};
use rmpv::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default read buffer size (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A connection to a marlin server.
pub struct Connection {
    stream: TcpStream,
    greeting: Greeting,
    buf: BytesMut,
    next_sync: u64,
}

impl Connection {
    /// Connects and consumes the greeting.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let mut block = [0u8; GREETING_SIZE];
        stream.read_exact(&mut block).await?;
        let greeting = decode_greeting(&block)?;
        tracing::debug!(
            "connected to marlin {} ({})",
            greeting.version,
            greeting.uuid
        );
        Ok(Self {
            stream,
            greeting,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            next_sync: 0,
        })
    }

    /// The greeting received on connect.
    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Sends a request with an auto-assigned sync; does not wait for the
    /// response, so requests can be pipelined.
    pub async fn send(
        &mut self,
        request_type: RequestType,
        body: &[(u64, Value)],
    ) -> Result<u64, ClientError> {
        self.next_sync += 1;
        let sync = self.next_sync;
        self.send_with_sync(request_type, sync, 0, body).await?;
        Ok(sync)
    }

    /// Sends a request with explicit sync and schema version.
    pub async fn send_with_sync(
        &mut self,
        request_type: RequestType,
        sync: u64,
        schema_version: u64,
        body: &[(u64, Value)],
    ) -> Result<(), ClientError> {
        let frame = encode_request(request_type, sync, schema_version, body)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Sends raw bytes, framed or not. Test instrumentation for malformed
    /// input.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Reads the next response frame.
    pub async fn read_response(&mut self) -> Result<Response, ClientError> {
        loop {
            if let Some(payload) = self.try_frame()? {
                return Ok(decode_response(&payload)?);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    fn try_frame(&mut self) -> Result<Option<Bytes>, ClientError> {
        match read_packet_len(&self.buf)? {
            FrameCheck::Incomplete => Ok(None),
            FrameCheck::Frame { len, prefix } => {
                if self.buf.len() < prefix + len {
                    return Ok(None);
                }
                let mut frame = self.buf.split_to(prefix + len);
                let payload = frame.split_off(prefix);
                Ok(Some(payload.freeze()))
            }
        }
    }

    /// Shuts down the write side; the server observes EOF.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
