//! The NET context.
//!
//! A single-threaded cooperative event loop owning the listening socket,
//! every client fd, all input buffers and the drain side of every output
//! buffer. One driver task per connection multiplexes its read and write
//! readiness with completions arriving from TX; the acceptor task owns the
//! listener and admission.
//!
//! Two levels of backpressure gate reading:
//! - per connection, the buffer rotation returning "no room" parks the
//!   read watcher until the flusher releases a pair;
//! - process wide, the in-flight message count is capped at one per
//!   connection plus `msg_max`; connections over the cap queue on a FIFO
//!   and are resumed one at a time as messages retire.

use crate::connection::{Connection, FlushResult};
use crate::message::{Completion, ConnId, Message, MessageKind, NetHop};
use crate::metrics::Metrics;
use marlin_protocol::ClientError;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::{oneshot, watch, Notify};

/// Synchronous round-trips into the NET context; the listener is never
/// touched by two contexts concurrently.
pub(crate) enum NetControl {
    Rebind {
        addr: SocketAddr,
        reply: oneshot::Sender<io::Result<SocketAddr>>,
    },
}

/// State shared by every task of the NET context. Single-threaded by
/// construction: all tasks run on one `LocalSet`.
pub(crate) struct NetShared {
    /// In-flight messages, created here and retired here.
    msg_count: Cell<usize>,
    /// Live connections; each reserves one disconnect message.
    conn_count: Cell<usize>,
    msg_max: usize,
    /// Connections whose input is paused by the global throttle, in the
    /// order they hit the cap.
    stopped: RefCell<VecDeque<Rc<ConnCtl>>>,
    pub tx_pipe: mpsc::Sender<Message>,
    pub metrics: Arc<Metrics>,
    schema_version: Arc<AtomicU64>,
    pub readahead: usize,
    pub ibuf_max: usize,
}

/// Per-connection handle on the stopped-connections FIFO.
#[derive(Default)]
pub(crate) struct ConnCtl {
    stopped: Cell<bool>,
    resume: Notify,
}

impl NetShared {
    /// True when a flood of requests would deplete the TX worker pool.
    fn must_stop_input(&self) -> bool {
        self.msg_count.get() > self.conn_count.get() + self.msg_max
    }

    fn msg_new(&self) {
        self.msg_count.set(self.msg_count.get() + 1);
    }

    /// Retires a message and hands the freed slot to the longest-stopped
    /// connection, if throttling has lifted.
    fn msg_free(&self) {
        self.msg_count.set(self.msg_count.get() - 1);
        self.resume();
    }

    fn stop(&self, ctl: &Rc<ConnCtl>) {
        debug_assert!(!ctl.stopped.get());
        ctl.stopped.set(true);
        self.stopped.borrow_mut().push_back(ctl.clone());
    }

    /// Strict FIFO fairness: wake exactly the head of the stopped list.
    fn resume(&self) {
        if self.must_stop_input() {
            return;
        }
        let mut stopped = self.stopped.borrow_mut();
        // Entries whose connection closed meanwhile are skipped lazily.
        while let Some(ctl) = stopped.pop_front() {
            if ctl.stopped.get() {
                ctl.stopped.set(false);
                ctl.resume.notify_one();
                break;
            }
        }
    }

    pub fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::Relaxed)
    }
}

async fn readable(half: &Option<OwnedReadHalf>) -> io::Result<()> {
    match half {
        Some(h) => h.readable().await,
        None => std::future::pending().await,
    }
}

async fn writable(half: &Option<OwnedWriteHalf>) -> io::Result<()> {
    match half {
        Some(h) => h.writable().await,
        None => std::future::pending().await,
    }
}

struct ConnDriver {
    conn: Connection,
    ctl: Rc<ConnCtl>,
    shared: Rc<NetShared>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
}

impl ConnDriver {
    /// The connection's event loop. Runs until the disconnect message
    /// completes its round trip or a context pipe dies.
    async fn drive(&mut self) {
        loop {
            let can_read = self.conn.read_armed && !self.conn.closed && !self.conn.stop_input;
            let can_write = self.conn.write_armed && !self.conn.closed && !self.conn.stop_input;
            let finished = tokio::select! {
                biased;
                done = self.done_rx.recv() => match done {
                    Some(completion) => self.on_completion(completion).await,
                    // The TX context is gone; nothing left to wait for.
                    None => true,
                },
                _ = self.ctl.resume.notified(), if self.ctl.stopped.get() => {
                    // This connection won a freed message slot. It may have
                    // no buffered input, so pass the wakeup along too.
                    self.conn.read_armed = true;
                    self.shared.resume();
                    self.on_input().await
                }
                ready = readable(&self.conn.read_half), if can_read => match ready {
                    Ok(()) => self.on_input().await,
                    Err(e) => {
                        tracing::debug!("[{}] read error: {}", self.conn.peer, e);
                        self.close().await
                    }
                },
                ready = writable(&self.conn.write_half), if can_write => match ready {
                    Ok(()) => self.on_output().await,
                    Err(e) => {
                        tracing::debug!("[{}] write error: {}", self.conn.peer, e);
                        self.close().await
                    }
                },
            };
            if finished {
                break;
            }
        }
    }

    /// Read-readiness: throttle, pick a buffer, read, frame, dispatch.
    async fn on_input(&mut self) -> bool {
        // Stop if there are too many pending requests, otherwise the flood
        // would deplete the TX worker pool and everything behind it.
        if self.shared.must_stop_input() {
            tracing::warn!(
                "[{}] request limit reached, stopping input",
                self.conn.peer
            );
            self.shared.stop(&self.ctl);
            self.conn.read_armed = false;
            return false;
        }

        let idx = match self.conn.input_buffer() {
            Err(e) => {
                // No buffer can ever fit this request: report and close.
                self.write_error_blocking(&e).await;
                return self.close().await;
            }
            Ok(None) => {
                // Both pairs busy; the flusher re-arms reading.
                self.conn.read_armed = false;
                return false;
            }
            Ok(Some(idx)) => idx,
        };

        match self.conn.try_read(idx) {
            Ok(0) => self.close().await,
            Ok(_) => {
                let schema_version = self.shared.schema_version();
                let (msgs, stop) = self.conn.enqueue_batch(schema_version);
                self.dispatch(msgs, stop).await
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                tracing::debug!("[{}] read error: {}", self.conn.peer, e);
                self.close().await
            }
        }
    }

    /// Publishes a framed batch to TX. A JOIN/SUBSCRIBE batch first drains
    /// committed output and then lends the socket to the stream handler.
    async fn dispatch(&mut self, mut msgs: Vec<Message>, stop: bool) -> bool {
        if stop {
            self.conn.read_armed = false;
            self.conn.write_armed = false;
            self.conn.stop_input = true;
            if let Err(e) = self.drain_committed().await {
                tracing::debug!("[{}] write error: {}", self.conn.peer, e);
                return self.close().await;
            }
            if let Some(Message {
                kind: MessageKind::Request { link, .. },
                ..
            }) = msgs.last_mut()
            {
                *link = self.conn.take_link();
            }
        }
        for msg in msgs {
            self.shared.msg_new();
            if self.shared.tx_pipe.send(msg).await.is_err() {
                return true;
            }
        }
        false
    }

    /// Write-readiness: flush until the socket blocks or output runs dry,
    /// re-arming input after each fully drained buffer since a drained
    /// pair may unblock rotation.
    async fn on_output(&mut self) -> bool {
        loop {
            match self.conn.flush() {
                Ok(FlushResult::Done) => {
                    if !self.conn.read_armed && !self.ctl.stopped.get() && !self.conn.closed {
                        self.conn.read_armed = true;
                    }
                }
                Ok(FlushResult::Partial) => return false,
                Ok(FlushResult::Idle) => {
                    self.conn.write_armed = false;
                    return false;
                }
                Err(e) => {
                    tracing::debug!("[{}] write error: {}", self.conn.peer, e);
                    return self.close().await;
                }
            }
        }
    }

    /// The NET hop of a completed route.
    async fn on_completion(&mut self, completion: Completion) -> bool {
        match completion.hop {
            NetHop::SendMsg { write_end } => {
                self.conn.retire(completion.buf, completion.len);
                self.conn.commit(completion.buf, write_end);
                let mut finished = false;
                if !self.conn.closed {
                    self.conn.write_armed = true;
                } else {
                    finished = self.send_disconnect().await;
                }
                self.shared.msg_free();
                finished
            }
            NetHop::SendGreeting { close, write_end } => {
                self.conn.commit(completion.buf, write_end);
                self.shared.msg_free();
                if close {
                    // Best-effort delivery of the on-connect error.
                    let _ = self.drain_committed().await;
                    return self.close().await;
                }
                // Handshake done: the greeting goes out and reading starts.
                self.conn.write_armed = true;
                self.conn.read_armed = true;
                false
            }
            NetHop::EndJoin { link } => {
                if let Some(link) = link {
                    self.conn.restore_link(link);
                }
                self.conn.retire(completion.buf, completion.len);
                self.shared.msg_free();
                self.conn.stop_input = false;
                if self.conn.closed {
                    return self.send_disconnect().await;
                }
                // Frame whatever readahead piled up during the stream,
                // then resume normal operation.
                let schema_version = self.shared.schema_version();
                let (msgs, stop) = self.conn.enqueue_batch(schema_version);
                let finished = self.dispatch(msgs, stop).await;
                if !stop {
                    self.conn.read_armed = true;
                    self.conn.write_armed = true;
                }
                finished
            }
            NetHop::EndSubscribe { link } => {
                if let Some(link) = link {
                    self.conn.restore_link(link);
                }
                self.conn.retire(completion.buf, completion.len);
                self.shared.msg_free();
                self.conn.stop_input = false;
                self.close().await
            }
            NetHop::FinishDisconnect => {
                self.shared.msg_free();
                true
            }
        }
    }

    /// Flushes every committed byte, waiting on the socket as needed.
    async fn drain_committed(&mut self) -> io::Result<()> {
        loop {
            if self.conn.write_half.is_none() {
                return Ok(());
            }
            match self.conn.flush()? {
                FlushResult::Idle => return Ok(()),
                FlushResult::Done => {}
                FlushResult::Partial => writable(&self.conn.write_half).await?,
            }
        }
    }

    /// The analogue of a blocking error write before teardown.
    async fn write_error_blocking(&mut self, e: &ClientError) {
        tracing::debug!("[{}] fatal request error: {}", self.conn.peer, e);
        let frame = marlin_protocol::encode_error(0, self.shared.schema_version(), e);
        if let Some(writer) = self.conn.write_half.as_mut() {
            let _ = writer.write_all(&frame).await;
        }
    }

    async fn close(&mut self) -> bool {
        self.conn.close();
        // Lazy removal from the stopped FIFO.
        self.ctl.stopped.set(false);
        self.send_disconnect().await
    }

    /// Queues the pre-allocated disconnect message once the connection is
    /// closed and idle; TX tears down the session and answers with
    /// `FinishDisconnect`.
    async fn send_disconnect(&mut self) -> bool {
        if let Some(msg) = self.conn.maybe_disconnect() {
            if self.shared.tx_pipe.send(msg).await.is_err() {
                return true;
            }
        }
        false
    }
}

/// Creates a connection, routes the synthetic connect message and drives
/// the connection until teardown.
async fn serve_connection(
    id: ConnId,
    peer: SocketAddr,
    stream: tokio::net::TcpStream,
    shared: Rc<NetShared>,
) {
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let conn = Connection::new(
        id,
        peer,
        stream,
        shared.readahead,
        shared.ibuf_max,
        shared.metrics.clone(),
    );

    shared.conn_count.set(shared.conn_count.get() + 1);
    shared.metrics.connections_total.inc();
    shared.metrics.connections_active.inc();
    // The pre-allocated disconnect message counts from the start; the
    // throttle formula discounts it with the per-connection term.
    shared.msg_new();

    let connect = conn.connect_message(done_tx);
    shared.msg_new();
    if shared.tx_pipe.send(connect).await.is_ok() {
        let mut driver = ConnDriver {
            conn,
            ctl: Rc::new(ConnCtl::default()),
            shared: shared.clone(),
            done_rx,
        };
        driver.drive().await;
        driver.conn.close();
        driver.ctl.stopped.set(false);
    }

    shared.conn_count.set(shared.conn_count.get() - 1);
    shared.metrics.connections_active.dec();
    tracing::info!("[{}] client disconnected", peer);
}

fn rebind(listener: &mut TcpListener, addr: SocketAddr) -> io::Result<SocketAddr> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    *listener = TcpListener::from_std(std_listener)?;
    listener.local_addr()
}

/// Sizing knobs handed down from the server configuration.
pub(crate) struct NetSettings {
    pub readahead: usize,
    pub ibuf_max: usize,
    pub msg_max: usize,
}

/// The NET context main loop: acceptor plus control round-trips.
pub(crate) async fn net_main(
    listener: std::net::TcpListener,
    tx_pipe: mpsc::Sender<Message>,
    mut control: mpsc::Receiver<NetControl>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
    schema_version: Arc<AtomicU64>,
    settings: NetSettings,
) {
    let mut listener = match TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to register listener: {}", e);
            return;
        }
    };
    let shared = Rc::new(NetShared {
        msg_count: Cell::new(0),
        conn_count: Cell::new(0),
        msg_max: settings.msg_max,
        stopped: RefCell::new(VecDeque::new()),
        tx_pipe,
        metrics,
        schema_version,
        readahead: settings.readahead,
        ibuf_max: settings.ibuf_max,
    });
    let mut next_id: ConnId = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            request = control.recv() => match request {
                Some(NetControl::Rebind { addr, reply }) => {
                    let _ = reply.send(rebind(&mut listener, addr));
                }
                None => break,
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();
                    next_id += 1;
                    tracing::info!("[{}] client connected", peer);
                    tokio::task::spawn_local(serve_connection(
                        next_id,
                        peer,
                        stream,
                        shared.clone(),
                    ));
                }
                Err(e) => tracing::error!("accept error: {}", e),
            },
        }
    }
    tracing::debug!("net context shutting down");
}
