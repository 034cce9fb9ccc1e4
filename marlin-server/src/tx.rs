//! The TX context.
//!
//! A single-threaded cooperative loop owning every session and the
//! producer side of every output buffer. The dispatcher routes incoming
//! messages to one worker task per connection (the connection's fiber);
//! a worker runs each handler to completion before taking the next
//! message, which is what preserves same-connection response order, while
//! workers of different connections interleave freely.
//!
//! Every handler is wrapped: a raised [`ClientError`] is serialized into
//! an error frame in place of the response. Only socket errors escape the
//! wrapper, and only for the replication handlers.

use crate::message::{Completion, ConnId, Message, MessageKind, NetHop};
use crate::metrics::Metrics;
use crate::obuf::Obuf;
use crate::processor::{ProcessError, ReplicaLink, RequestProcessor};
use crate::session::Session;
use bytes::Bytes;
use marlin_protocol::{
    encode_greeting, reply, ClientError, DmlRequest, ErrorCode, RequestBody, RequestHeader,
    RequestType,
};
use rmpv::Value;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// TX-side state of one connection.
struct TxConn {
    session: Session,
    obuf: [Arc<Obuf>; 2],
    done: mpsc::UnboundedSender<Completion>,
}

/// The TX context main loop: routes each message to its connection's
/// worker. Per-connection FIFO holds because the dispatcher forwards in
/// arrival order into an ordered queue.
pub(crate) async fn tx_main<P: RequestProcessor>(
    processor: P,
    mut pipe: mpsc::Receiver<Message>,
    schema_cache: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
    instance: Uuid,
) {
    let processor = Rc::new(processor);
    schema_cache.store(processor.schema_version(), Ordering::Relaxed);
    let mut workers: HashMap<ConnId, mpsc::UnboundedSender<Message>> = HashMap::new();

    while let Some(msg) = pipe.recv().await {
        match msg.kind {
            MessageKind::Connect { .. } => {
                let (worker_tx, worker_rx) = mpsc::unbounded_channel();
                let conn = msg.conn;
                let _ = worker_tx.send(msg);
                workers.insert(conn, worker_tx);
                tokio::task::spawn_local(conn_worker(
                    processor.clone(),
                    worker_rx,
                    schema_cache.clone(),
                    metrics.clone(),
                    instance,
                ));
            }
            MessageKind::Disconnect => {
                // Dropping the sender ends the worker after this message.
                if let Some(worker) = workers.remove(&msg.conn) {
                    let _ = worker.send(msg);
                }
            }
            MessageKind::Request { .. } => {
                if let Some(worker) = workers.get(&msg.conn) {
                    let _ = worker.send(msg);
                }
            }
        }
    }
    tracing::debug!("tx context shutting down");
}

/// One connection's fiber: connect, then requests in order, then
/// disconnect.
async fn conn_worker<P: RequestProcessor>(
    processor: Rc<P>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    schema_cache: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
    instance: Uuid,
) {
    let Some(first) = rx.recv().await else { return };
    let MessageKind::Connect { peer, obuf, done } = first.kind else {
        debug_assert!(false, "a connection's first message must be connect");
        return;
    };
    let state = TxConn {
        session: Session::new(peer),
        obuf,
        done,
    };
    tx_process_connect(&*processor, &state, instance).await;
    schema_cache.store(processor.schema_version(), Ordering::Relaxed);

    while let Some(msg) = rx.recv().await {
        match msg.kind {
            MessageKind::Request {
                header,
                body,
                buf,
                len,
                link,
            } => {
                state.session.set_sync(header.sync);
                if let Some(request_type) = header.request_type() {
                    metrics
                        .requests_total
                        .with_label_values(&[&request_type.to_string()])
                        .inc();
                }
                let hop = process_request(&*processor, &state, &header, body, buf, link, &metrics)
                    .await;
                schema_cache.store(processor.schema_version(), Ordering::Relaxed);
                if state.done.send(Completion { buf, len, hop }).is_err() {
                    break;
                }
            }
            MessageKind::Disconnect => {
                tx_process_disconnect(&*processor, &state).await;
                let _ = state.done.send(Completion {
                    buf: 0,
                    len: 0,
                    hop: NetHop::FinishDisconnect,
                });
                break;
            }
            MessageKind::Connect { .. } => {
                debug_assert!(false, "duplicate connect message");
                break;
            }
        }
    }
}

/// Session creation, greeting, on-connect hook. A hook failure turns the
/// greeting slot into an error frame and closes the connection after a
/// best-effort delivery.
async fn tx_process_connect<P: RequestProcessor>(px: &P, state: &TxConn, instance: Uuid) {
    let session = &state.session;
    let close = match px.on_connect(session).await {
        Ok(()) => {
            let block = encode_greeting(env!("CARGO_PKG_VERSION"), &instance, session.salt());
            state.obuf[0].append(Bytes::copy_from_slice(&block));
            false
        }
        Err(e) => {
            tracing::warn!("[{}] connection rejected: {}", session.peer(), e);
            state.obuf[0].append(reply::encode_error(0, px.schema_version(), &e));
            true
        }
    };
    let hop = NetHop::SendGreeting {
        close,
        write_end: state.obuf[0].size(),
    };
    let _ = state.done.send(Completion {
        buf: 0,
        len: 0,
        hop,
    });
}

/// On-disconnect hook, session teardown, output buffer teardown.
async fn tx_process_disconnect<P: RequestProcessor>(px: &P, state: &TxConn) {
    px.on_disconnect(&state.session).await;
    state.obuf[0].clear();
    state.obuf[1].clear();
}

fn check_schema<P: RequestProcessor>(px: &P, header: &RequestHeader) -> Result<(), ClientError> {
    let current = px.schema_version();
    if header.schema_version != 0 && header.schema_version != current {
        return Err(ClientError::new(
            ErrorCode::WrongSchemaVersion,
            format!(
                "wrong schema version, current: {current}, in request: {}",
                header.schema_version
            ),
        ));
    }
    Ok(())
}

/// Serializes a handler failure into the response slot.
fn reply_error<P: RequestProcessor>(
    px: &P,
    metrics: &Metrics,
    out: &Obuf,
    sync: u64,
    e: &ClientError,
) {
    metrics
        .errors_total
        .with_label_values(&[&e.code.to_string()])
        .inc();
    out.append(reply::encode_error(sync, px.schema_version(), e));
}

/// Runs the TX hop of a request's route and returns its NET hop.
async fn process_request<P: RequestProcessor>(
    px: &P,
    state: &TxConn,
    header: &RequestHeader,
    body: RequestBody,
    buf: usize,
    link: Option<ReplicaLink>,
    metrics: &Metrics,
) -> NetHop {
    let out = &*state.obuf[buf];
    let session = &state.session;
    match body {
        RequestBody::Dml(request) => {
            if header.request_type() == Some(RequestType::Select) {
                tx_process_select(px, session, out, header, &request, metrics).await;
            } else {
                tx_process1(px, session, out, header, &request, metrics).await;
            }
            NetHop::SendMsg {
                write_end: out.size(),
            }
        }
        RequestBody::Join { body } => NetHop::EndJoin {
            link: tx_process_join_subscribe(px, session, header, &body, link, false).await,
        },
        RequestBody::Subscribe { body } => NetHop::EndSubscribe {
            link: tx_process_join_subscribe(px, session, header, &body, link, true).await,
        },
        misc => {
            tx_process_misc(px, session, out, header, &misc, metrics).await;
            NetHop::SendMsg {
                write_end: out.size(),
            }
        }
    }
}

/// Point DML: the affected tuple, if any, comes back as a DATA array.
async fn tx_process1<P: RequestProcessor>(
    px: &P,
    session: &Session,
    out: &Obuf,
    header: &RequestHeader,
    request: &DmlRequest,
    metrics: &Metrics,
) {
    let request_type = header
        .request_type()
        .filter(|t| t.is_dml())
        .unwrap_or(RequestType::Insert);
    let result = match check_schema(px, header) {
        Ok(()) => px.process_dml(request_type, request, session).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(tuple) => {
            let tuples: Vec<Value> = tuple.into_iter().collect();
            out.append(reply::encode_data(header.sync, px.schema_version(), &tuples));
        }
        Err(e) => reply_error(px, metrics, out, header.sync, &e),
    }
}

async fn tx_process_select<P: RequestProcessor>(
    px: &P,
    session: &Session,
    out: &Obuf,
    header: &RequestHeader,
    request: &DmlRequest,
    metrics: &Metrics,
) {
    let result = match check_schema(px, header) {
        Ok(()) => px.process_select(request, session).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(tuples) => {
            out.append(reply::encode_data(header.sync, px.schema_version(), &tuples));
        }
        Err(e) => reply_error(px, metrics, out, header.sync, &e),
    }
}

/// CALL/CALL_16/EVAL/AUTH/PING.
async fn tx_process_misc<P: RequestProcessor>(
    px: &P,
    session: &Session,
    out: &Obuf,
    header: &RequestHeader,
    body: &RequestBody,
    metrics: &Metrics,
) {
    let result = match check_schema(px, header) {
        Err(e) => Err(e),
        Ok(()) => match (header.request_type(), body) {
            (Some(RequestType::Call | RequestType::Call16), RequestBody::Call(request)) => px
                .process_call(request, session)
                .await
                .map(|tuples| reply::encode_data(header.sync, px.schema_version(), &tuples)),
            (Some(RequestType::Eval), RequestBody::Call(request)) => px
                .process_eval(request, session)
                .await
                .map(|tuples| reply::encode_data(header.sync, px.schema_version(), &tuples)),
            (Some(RequestType::Auth), RequestBody::Auth(request)) => px
                .process_auth(request, session)
                .await
                .map(|()| reply::encode_ok(header.sync, px.schema_version())),
            (Some(RequestType::Ping), RequestBody::Ping) => {
                Ok(reply::encode_ok(header.sync, px.schema_version()))
            }
            _ => Err(ClientError::new(
                ErrorCode::Unknown,
                "request body does not match its type",
            )),
        },
    };
    match result {
        Ok(frame) => {
            out.append(frame);
        }
        Err(e) => reply_error(px, metrics, out, header.sync, &e),
    }
}

/// JOIN/SUBSCRIBE: the handler owns the socket until the stream ends.
/// Socket errors are never answered over the same socket; other errors go
/// out as a direct error frame before the socket travels back.
async fn tx_process_join_subscribe<P: RequestProcessor>(
    px: &P,
    session: &Session,
    header: &RequestHeader,
    body: &[u8],
    link: Option<ReplicaLink>,
    subscribe: bool,
) -> Option<ReplicaLink> {
    let Some(mut link) = link else {
        // The socket was gone before the handler could take over.
        return None;
    };
    let result = if subscribe {
        px.process_subscribe(&mut link, header, body, session).await
    } else {
        px.process_join(&mut link, header, body, session).await
    };
    match result {
        Ok(()) => {}
        Err(ProcessError::Socket(e)) => {
            tracing::debug!(
                "[{}] replication stream socket error: {}",
                session.peer(),
                e
            );
        }
        Err(ProcessError::Client(e)) => {
            tracing::warn!("[{}] replication stream error: {}", session.peer(), e);
            let frame = reply::encode_error(header.sync, px.schema_version(), &e);
            let _ = link.writer.write_all(&frame).await;
        }
    }
    Some(link)
}
