//! Per-connection state on the NET context.
//!
//! Interaction scheme:
//!
//! ```text
//!  Receive from the network.
//!     |
//! +---|---------------------+   +------------+
//! |   |       NET context   |   | TX context |
//! |   v                     |   |            |
//! | ibuf[0]- - - - - - - - -|- -|- - >+      |
//! |                         |   |     |      |
//! |           ibuf[1]       |   |     |      |
//! |                         |   |     |      |
//! | obuf[0] <- - - - - - - -|- -|- - -+      |
//! |    |                    |   |     |      |
//! |    |      obuf[1] <- - -|- -|- - -+      |
//! +----|-----------|--------+   +------------+
//!      |           v
//!      |   Send to network after obuf[1],
//!      v   i.e. older responses are sent first.
//! ```
//!
//! Each connection owns two rotating input buffers paired with two output
//! buffers: requests framed from `ibuf[k]` are answered through `obuf[k]`,
//! and the flusher always drains the older pair first, which is what keeps
//! responses in request order on the wire. When neither pair can accept
//! input, reading stops until a flush releases a pair.

use crate::ibuf::Ibuf;
use crate::message::{ConnId, Completion, Message, MessageKind};
use crate::metrics::Metrics;
use crate::obuf::Obuf;
use crate::processor::ReplicaLink;
use marlin_protocol::{
    frame, reply, request, ClientError, ErrorCode, FrameCheck, RequestBody, MIN_REQUEST_SIZE,
};
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Upper bound on segments per vectored write.
const MAX_WRITE_SEGMENTS: usize = 64;

/// Outcome of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushResult {
    /// One output buffer drained completely.
    Done,
    /// The socket did not take everything; stay armed for writing.
    Partial,
    /// Nothing to send.
    Idle,
}

pub(crate) struct Connection {
    pub id: ConnId,
    pub peer: SocketAddr,
    pub(crate) read_half: Option<OwnedReadHalf>,
    pub(crate) write_half: Option<OwnedWriteHalf>,
    ibuf: [Ibuf; 2],
    obuf: [Arc<Obuf>; 2],
    /// Index of the input buffer currently receiving socket bytes.
    cur: usize,
    /// Bytes at the tail of the current input buffer that have been read
    /// from the socket but not framed yet. A count, not a pointer, so
    /// buffer growth cannot invalidate it.
    parse_size: usize,
    /// Pre-allocated disconnect message; taken exactly once.
    disconnect: Option<Message>,
    ibuf_max: usize,
    metrics: Arc<Metrics>,
    /// Read watcher.
    pub read_armed: bool,
    /// Write watcher.
    pub write_armed: bool,
    /// A replication stream owns the socket; both watchers stay down.
    pub stop_input: bool,
    /// The fd is gone; set once by `close()`.
    pub closed: bool,
}

impl Connection {
    pub fn new(
        id: ConnId,
        peer: SocketAddr,
        stream: TcpStream,
        readahead: usize,
        ibuf_max: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_parts(id, peer, Some((reader, writer)), readahead, ibuf_max, metrics)
    }

    fn from_parts(
        id: ConnId,
        peer: SocketAddr,
        halves: Option<(OwnedReadHalf, OwnedWriteHalf)>,
        readahead: usize,
        ibuf_max: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (read_half, write_half) = match halves {
            Some((r, w)) => (Some(r), Some(w)),
            None => (None, None),
        };
        Self {
            id,
            peer,
            read_half,
            write_half,
            ibuf: [Ibuf::new(readahead), Ibuf::new(readahead)],
            obuf: [Arc::new(Obuf::new()), Arc::new(Obuf::new())],
            cur: 0,
            parse_size: 0,
            disconnect: Some(Message {
                conn: id,
                kind: MessageKind::Disconnect,
            }),
            ibuf_max,
            metrics,
            read_armed: false,
            write_armed: false,
            stop_input: false,
            closed: false,
        }
    }

    /// The synthetic first message carrying what TX needs for the session.
    pub fn connect_message(&self, done: mpsc::UnboundedSender<Completion>) -> Message {
        Message {
            conn: self.id,
            kind: MessageKind::Connect {
                peer: self.peer,
                obuf: [self.obuf[0].clone(), self.obuf[1].clone()],
                done,
            },
        }
    }

    /// No request bytes are in flight in either input buffer. Together
    /// with a closed fd this makes the connection collectable.
    pub fn is_idle(&self) -> bool {
        self.ibuf[0].used() == 0 && self.ibuf[1].used() == 0
    }

    /// Picks an input buffer with room for the next read.
    ///
    /// At most two buffers exist: one open for input, the other waiting
    /// for its paired output to flush. `Ok(None)` means both pairs are
    /// busy; input stops until the flusher releases one. Growing beyond
    /// the configured cap is refused outright since neither buffer could
    /// ever fit the request.
    pub fn input_buffer(&mut self) -> Result<Option<usize>, ClientError> {
        let old = self.cur;

        let mut to_read = MIN_REQUEST_SIZE;
        // The leading type byte is validated in enqueue_batch.
        if self.parse_size > 0 {
            if let Ok(FrameCheck::Frame { len, .. }) =
                frame::read_packet_len(self.ibuf[old].tail(self.parse_size))
            {
                to_read = len;
            }
        }
        if to_read > self.ibuf_max {
            return Err(ClientError::new(
                ErrorCode::MemoryIssue,
                format!(
                    "packet size {to_read} exceeds the input buffer limit {}",
                    self.ibuf_max
                ),
            ));
        }

        if self.ibuf[old].unused() >= to_read {
            return Ok(Some(old));
        }

        // Reuse the current buffer if it holds nothing but the unparsed
        // tail and reusing it cannot bloat output: either it starts at the
        // tail, or the paired obuf has nothing queued (a pipelining client
        // on an otherwise idle connection, or one large packet to fit).
        if self.ibuf[old].used() == self.parse_size
            && (self.ibuf[old].pos() == self.parse_size || self.obuf[old].size() == 0)
        {
            self.ibuf[old].reserve(to_read);
            return Ok(Some(old));
        }

        let new = old ^ 1;
        if self.ibuf[new].used() != 0 || self.obuf[new].pending() != 0 {
            // Wait until the other pair is flushed and becomes reusable.
            return Ok(None);
        }

        self.ibuf[new].reserve(to_read + self.parse_size);
        // Move the unparsed tail so the old buffer can be recycled once
        // its in-flight requests retire.
        if self.parse_size > 0 {
            let tail = self.ibuf[old].tail(self.parse_size).to_vec();
            self.ibuf[old].rewind_wpos(self.parse_size);
            self.ibuf[new].append(&tail);
            if self.ibuf[old].used() == 0 && self.obuf[old].pending() == 0 {
                self.obuf[old].reset();
                self.ibuf[old].reset(self.ibuf_max);
            }
        }
        self.cur = new;
        Ok(Some(new))
    }

    /// Non-blocking read into the chosen input buffer. `Ok(0)` is EOF.
    pub fn try_read(&mut self, idx: usize) -> io::Result<usize> {
        let Some(reader) = self.read_half.as_ref() else {
            return Ok(0);
        };
        let spare = self.ibuf[idx].spare_mut();
        let n = reader.try_read(spare)?;
        if n > 0 {
            self.ibuf[idx].advance_wpos(n);
            self.parse_size += n;
            self.metrics.net_received_bytes.inc_by(n as u64);
        }
        Ok(n)
    }

    /// Frames and decodes every complete request in the unparsed tail.
    ///
    /// Decode failures are answered in place (the connection survives) and
    /// their bytes retired immediately; an unframeable tail is answered
    /// with `INVALID_MSGPACK` and discarded wholesale, since there is no
    /// boundary to resynchronize on. JOIN/SUBSCRIBE end the batch and
    /// stop input until the stream handler returns.
    pub fn enqueue_batch(&mut self, schema_version: u64) -> (Vec<Message>, bool) {
        let mut out = Vec::new();
        let mut stop_input = false;
        while self.parse_size > 0 && !stop_input {
            let cur = self.cur;
            let (len, prefix) = match frame::read_packet_len(self.ibuf[cur].tail(self.parse_size))
            {
                Err(e) => {
                    let tail_len = self.parse_size;
                    self.parse_size = 0;
                    self.ibuf[cur].rewind_wpos(tail_len);
                    self.reply_error(cur, 0, schema_version, &ClientError::from(e));
                    break;
                }
                Ok(FrameCheck::Incomplete) => break,
                Ok(FrameCheck::Frame { len, prefix }) => (len, prefix),
            };
            let total = prefix + len;
            if total > self.parse_size {
                // The body has not fully arrived yet.
                break;
            }

            let decoded = {
                let payload = &self.ibuf[cur].tail(self.parse_size)[prefix..total];
                let mut rd = payload;
                match request::decode_header(&mut rd) {
                    Err(e) => Err((0, ClientError::from(e))),
                    Ok(header) => match request::decode_request(&header, rd) {
                        Ok(body) => Ok((header, body)),
                        Err(e) => Err((header.sync, e)),
                    },
                }
            };
            match decoded {
                Ok((header, body)) => {
                    if matches!(
                        body,
                        RequestBody::Join { .. } | RequestBody::Subscribe { .. }
                    ) {
                        stop_input = true;
                    }
                    out.push(Message {
                        conn: self.id,
                        kind: MessageKind::Request {
                            header,
                            body,
                            buf: cur,
                            len: total,
                            link: None,
                        },
                    });
                }
                Err((sync, e)) => {
                    // The bad request never enters the queue, so its bytes
                    // are reclaimed right away.
                    self.ibuf[cur].advance_rpos(total);
                    self.reply_error(cur, sync, schema_version, &e);
                }
            }
            self.parse_size -= total;
        }
        (out, stop_input)
    }

    /// Answers a malformed request in place through the paired obuf.
    /// Committed immediately: protocol errors never take the TX round
    /// trip.
    fn reply_error(&mut self, buf: usize, sync: u64, schema_version: u64, e: &ClientError) {
        tracing::debug!("[{}] request error: {}", self.peer, e);
        self.metrics
            .errors_total
            .with_label_values(&[&e.code.to_string()])
            .inc();
        self.obuf[buf].append_committed(reply::encode_error(sync, schema_version, e));
        if !self.closed {
            self.write_armed = true;
        }
    }

    /// Advances the commit savepoint of a pair's obuf to a message's
    /// post-TX `write_end`; the response becomes drainable.
    pub fn commit(&mut self, buf: usize, write_end: u64) {
        self.obuf[buf].advance_wend(write_end);
    }

    /// Retires a request's bytes once its response has been committed.
    pub fn retire(&mut self, buf: usize, len: usize) {
        self.ibuf[buf].advance_rpos(len);
    }

    /// One vectored write, always preferring the older output buffer: a
    /// partial write from a newer buffer would interleave replies.
    pub fn flush(&mut self) -> io::Result<FlushResult> {
        let prev = self.cur ^ 1;
        let idx = if self.obuf[prev].pending() > 0 {
            prev
        } else if self.ibuf[prev].used() > 0 || self.obuf[self.cur].pending() == 0 {
            return Ok(FlushResult::Idle);
        } else {
            self.cur
        };
        let Some(writer) = self.write_half.as_ref() else {
            return Ok(FlushResult::Idle);
        };

        let slices = self.obuf[idx].drain_slices(MAX_WRITE_SEGMENTS);
        let iov: Vec<IoSlice<'_>> = slices.iter().map(|b| IoSlice::new(b)).collect();
        match writer.try_write_vectored(&iov) {
            Ok(n) => {
                self.metrics.net_sent_bytes.inc_by(n as u64);
                self.obuf[idx].advance(n);
                if self.obuf[idx].pending() == 0 {
                    if self.ibuf[idx].used() == 0 {
                        // The pair is idle: recycle it back to offset zero.
                        self.obuf[idx].reset();
                        self.ibuf[idx].reset(self.ibuf_max);
                    }
                    Ok(FlushResult::Done)
                } else {
                    Ok(FlushResult::Partial)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(FlushResult::Partial),
            Err(e) => Err(e),
        }
    }

    /// Takes both socket halves for a replication stream handler.
    pub fn take_link(&mut self) -> Option<ReplicaLink> {
        match (self.read_half.take(), self.write_half.take()) {
            (Some(reader), Some(writer)) => Some(ReplicaLink { reader, writer }),
            _ => None,
        }
    }

    /// Puts the socket back after a replication stream ends. A closed
    /// connection just drops it.
    pub fn restore_link(&mut self, link: ReplicaLink) {
        if self.closed {
            return;
        }
        self.read_half = Some(link.reader);
        self.write_half = Some(link.writer);
    }

    /// Initiates shutdown. May be called many times; resources are
    /// released once. Truncating the unparsed tail guarantees no further
    /// messages are framed, so the last retiring message observes an idle
    /// connection.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.read_armed = false;
        self.write_armed = false;
        self.read_half = None;
        self.write_half = None;
        let tail = self.parse_size;
        self.parse_size = 0;
        self.ibuf[self.cur].rewind_wpos(tail);
    }

    /// The pre-allocated disconnect message, once the connection is both
    /// closed and idle. Yields `Some` exactly once.
    pub fn maybe_disconnect(&mut self) -> Option<Message> {
        if self.closed && self.is_idle() {
            self.disconnect.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use marlin_protocol::{encode_request, RequestType};

    fn test_connection(readahead: usize) -> Connection {
        Connection::from_parts(
            1,
            "127.0.0.1:5000".parse().unwrap(),
            None,
            readahead,
            64 * 1024,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    /// Appends raw bytes as if they had arrived from the socket.
    fn feed(conn: &mut Connection, data: &[u8]) {
        conn.ibuf[conn.cur].append(data);
        conn.parse_size += data.len();
    }

    fn ping(sync: u64) -> Vec<u8> {
        encode_request(RequestType::Ping, sync, 0, &[]).unwrap()
    }

    #[test]
    fn test_input_buffer_keeps_current_when_room() {
        let mut conn = test_connection(64);
        assert_eq!(conn.input_buffer().unwrap(), Some(0));
        assert_eq!(conn.cur, 0);
    }

    #[test]
    fn test_input_buffer_grows_for_lone_unparsed_tail() {
        let mut conn = test_connection(8);
        // Fill the whole buffer with an unparsed prefix of a large packet.
        feed(&mut conn, &[0xce, 0x00, 0x00, 0x10, 0x00, 1, 2, 3]);
        assert_eq!(conn.ibuf[0].unused(), 0);
        // used == parse_size and pos == parse_size: grow in place.
        let idx = conn.input_buffer().unwrap().unwrap();
        assert_eq!(idx, 0);
        assert!(conn.ibuf[0].unused() >= 0x1000);
    }

    #[test]
    fn test_input_buffer_rotates_when_current_pinned() {
        let mut conn = test_connection(16);
        // 12 in-flight bytes with an unflushed response pin the current
        // buffer; a truncated 4-byte prefix fills it to capacity.
        feed(&mut conn, &[0u8; 12]);
        conn.parse_size = 0;
        conn.obuf[0].append_committed(Bytes::from_static(b"resp"));
        feed(&mut conn, &[0xce, 0x00, 0x00, 0x10]);

        let idx = conn.input_buffer().unwrap().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(conn.cur, 1);
        // The unparsed tail moved to the new buffer; the old one kept the
        // in-flight bytes only.
        assert_eq!(conn.ibuf[1].used(), 4);
        assert_eq!(conn.ibuf[0].used(), 12);
        assert_eq!(conn.parse_size, 4);
    }

    #[test]
    fn test_input_buffer_no_room_when_both_pairs_busy() {
        let mut conn = test_connection(16);
        feed(&mut conn, &[0u8; 14]);
        conn.parse_size = 0;
        conn.obuf[0].append_committed(Bytes::from_static(b"r0"));
        feed(&mut conn, &[0xce, 0x00]); // truncated prefix, buffer full
        // The other pair is busy too.
        conn.ibuf[1].append(b"inflight");
        assert_eq!(conn.input_buffer().unwrap(), None);

        // Releasing the other pair unblocks rotation.
        conn.ibuf[1].advance_rpos(8);
        conn.ibuf[1].reset(64 * 1024);
        assert_eq!(conn.input_buffer().unwrap(), Some(1));
        assert_eq!(conn.ibuf[1].used(), 2);
    }

    #[test]
    fn test_oversized_packet_is_refused() {
        let mut conn = test_connection(16);
        let mut prefix = vec![0xce];
        prefix.extend_from_slice(&(10_000_000u32).to_be_bytes());
        feed(&mut conn, &prefix);
        let err = conn.input_buffer().unwrap_err();
        assert_eq!(err.code, ErrorCode::MemoryIssue);
    }

    #[test]
    fn test_enqueue_batch_decodes_pipelined_requests() {
        let mut conn = test_connection(256);
        let mut data = ping(1);
        data.extend(ping(2));
        data.extend(ping(3));
        feed(&mut conn, &data);

        let (msgs, stop) = conn.enqueue_batch(1);
        assert!(!stop);
        assert_eq!(msgs.len(), 3);
        assert_eq!(conn.parse_size, 0);
        let syncs: Vec<u64> = msgs
            .iter()
            .map(|m| match &m.kind {
                MessageKind::Request { header, .. } => header.sync,
                _ => panic!("not a request"),
            })
            .collect();
        assert_eq!(syncs, vec![1, 2, 3]);
    }

    #[test]
    fn test_enqueue_batch_waits_for_partial_frame() {
        let mut conn = test_connection(256);
        let data = ping(7);
        feed(&mut conn, &data[..data.len() - 2]);

        let (msgs, _) = conn.enqueue_batch(1);
        assert!(msgs.is_empty());
        assert_eq!(conn.parse_size, data.len() - 2);

        feed(&mut conn, &data[data.len() - 2..]);
        let (msgs, _) = conn.enqueue_batch(1);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn test_enqueue_batch_invalid_length_marker() {
        let mut conn = test_connection(256);
        feed(&mut conn, &[0xc1, 0x00, 0x00, 0x00]);

        let (msgs, _) = conn.enqueue_batch(1);
        assert!(msgs.is_empty());
        // The tail was discarded and an error reply committed; the
        // connection stays usable.
        assert_eq!(conn.parse_size, 0);
        assert!(conn.obuf[0].pending() > 0);
        assert!(!conn.closed);
        assert!(conn.is_idle());

        // A valid request afterwards still goes through.
        feed(&mut conn, &ping(9));
        let (msgs, _) = conn.enqueue_batch(1);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn test_enqueue_batch_unknown_request_type() {
        let mut conn = test_connection(256);
        // Hand-built frame with request type 200.
        let mut payload = Vec::new();
        rmp::encode::write_map_len(&mut payload, 2).unwrap();
        rmp::encode::write_uint(&mut payload, 0x00).unwrap();
        rmp::encode::write_uint(&mut payload, 200).unwrap();
        rmp::encode::write_uint(&mut payload, 0x01).unwrap();
        rmp::encode::write_uint(&mut payload, 0x77).unwrap();
        let mut data = vec![payload.len() as u8];
        data.extend(&payload);
        feed(&mut conn, &data);

        let (msgs, _) = conn.enqueue_batch(1);
        assert!(msgs.is_empty());
        // The bad request's bytes were reclaimed immediately.
        assert!(conn.is_idle());
        assert!(conn.obuf[0].pending() > 0);
    }

    #[test]
    fn test_join_stops_input_mid_batch() {
        let mut conn = test_connection(256);
        let mut data = ping(1);
        data.extend(encode_request(RequestType::Join, 2, 0, &[]).unwrap());
        // A request pipelined after JOIN stays unparsed.
        data.extend(ping(3));
        feed(&mut conn, &data);

        let (msgs, stop) = conn.enqueue_batch(1);
        assert!(stop);
        assert_eq!(msgs.len(), 2);
        assert!(conn.parse_size > 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut conn = test_connection(256);
        feed(&mut conn, &[0xce, 0x00]); // truncated prefix
        conn.close();
        assert!(conn.closed);
        assert_eq!(conn.parse_size, 0);
        assert!(conn.is_idle());

        let first = conn.maybe_disconnect();
        assert!(first.is_some());
        conn.close();
        assert!(conn.maybe_disconnect().is_none());
    }

    #[test]
    fn test_close_with_inflight_defers_disconnect() {
        let mut conn = test_connection(256);
        feed(&mut conn, &ping(1));
        let (msgs, _) = conn.enqueue_batch(1);
        assert_eq!(msgs.len(), 1);

        conn.close();
        // The in-flight request still holds buffer bytes.
        assert!(conn.maybe_disconnect().is_none());

        // Retirement makes the connection idle and releases the
        // disconnect message.
        conn.retire(0, msg_len(&msgs[0]));
        assert!(conn.maybe_disconnect().is_some());
    }

    fn msg_len(msg: &Message) -> usize {
        match &msg.kind {
            MessageKind::Request { len, .. } => *len,
            _ => panic!("not a request"),
        }
    }

    #[test]
    fn test_flush_idle_without_output() {
        let mut conn = test_connection(256);
        assert_eq!(conn.flush().unwrap(), FlushResult::Idle);
    }
}
