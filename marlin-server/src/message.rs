//! Cross-context messages.
//!
//! Every request travels a two-hop route: a TX hop that runs the handler
//! and a NET hop that finishes the exchange on the connection's thread.
//!
//! | route              | TX hop                     | NET hop           |
//! |--------------------|----------------------------|-------------------|
//! | dml point          | `tx_process1`              | `SendMsg`         |
//! | select             | `tx_process_select`        | `SendMsg`         |
//! | call/eval/auth/ping| `tx_process_misc`          | `SendMsg`         |
//! | join               | `tx_process_join_subscribe`| `EndJoin`         |
//! | subscribe          | `tx_process_join_subscribe`| `EndSubscribe`    |
//! | connect            | `tx_process_connect`       | `SendGreeting`    |
//! | disconnect         | `tx_process_disconnect`    | `FinishDisconnect`|
//!
//! A [`Message`] is created in NET, routed to TX over the shared pipe, and
//! retired in NET when its [`Completion`] arrives. `len` is the number of
//! input-buffer bytes the request occupies; it doubles as the reference the
//! message holds on the connection's input buffer.

use crate::obuf::Obuf;
use crate::processor::ReplicaLink;
use marlin_protocol::{RequestBody, RequestHeader};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) type ConnId = u64;

pub(crate) struct Message {
    pub conn: ConnId,
    pub kind: MessageKind,
}

pub(crate) enum MessageKind {
    /// Synthetic first message of every connection: carries what TX needs
    /// to build the session and reach the output buffers.
    Connect {
        peer: SocketAddr,
        obuf: [Arc<Obuf>; 2],
        done: mpsc::UnboundedSender<Completion>,
    },
    /// A framed client request.
    Request {
        header: RequestHeader,
        body: RequestBody,
        /// Index of the ibuf/obuf pair holding this request.
        buf: usize,
        /// Bytes the request occupies in the input buffer.
        len: usize,
        /// Socket halves, present only for JOIN/SUBSCRIBE.
        link: Option<ReplicaLink>,
    },
    /// Synthetic last message; pre-allocated at accept so teardown never
    /// allocates.
    Disconnect,
}

/// The NET hop of a route, delivered back to the connection driver.
pub(crate) struct Completion {
    pub buf: usize,
    pub len: usize,
    pub hop: NetHop,
}

pub(crate) enum NetHop {
    /// Response staged; NET advances the commit savepoint to `write_end`,
    /// retires the request and arms the flusher.
    SendMsg { write_end: u64 },
    /// Greeting (or the on-connect error) staged.
    SendGreeting { close: bool, write_end: u64 },
    /// JOIN stream finished; the socket comes back.
    EndJoin { link: Option<ReplicaLink> },
    /// SUBSCRIBE stream finished; the connection closes.
    EndSubscribe { link: Option<ReplicaLink> },
    /// Session destroyed; the connection may be dropped.
    FinishDisconnect,
}
