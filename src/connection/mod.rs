//! Buffered, non-blocking connections.
//!
//! A `Connection` owns a receive queue and a send queue of `Bytes` chunks.
//! The dispatcher thread fills the receive queue and drains the send queue;
//! application threads read from the former and append to the latter.
//! Reads never block and never touch the socket: when the buffered bytes
//! cannot satisfy a read it fails with [`Error::InsufficientData`] and the
//! caller retries after the next `on_data` callback.
//!
//! Secure connections route both queues through a [`SecureSession`], which
//! keeps every application byte behind the handshake.

pub mod engine;
pub mod handler;
pub(crate) mod secure;

pub use engine::{
    EngineFactory, EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus, InlineExecutor,
    RustlsEngine, TaskExecutor, TlsClient, TlsServer,
};
pub use handler::{Capabilities, Handler, HandlerFactory, NoopHandler};

use crate::error::{Error, Result};
use crate::queue::{join, ChunkQueue};
use crate::runtime::buffer::ReadOutcome;
use crate::runtime::dispatcher::{DispatcherHandle, KeyUpdate};
use crate::runtime::socket::SocketHandle;
use bytes::{Buf, Bytes};
use handler::HandlerSlot;
use parking_lot::{Condvar, Mutex};
use secure::SecureSession;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const NO_THRESHOLD: usize = usize::MAX;

/// Which timeout closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Idle,
    Connection,
}

#[derive(Default)]
struct Lifecycle {
    /// The application-level open callback has fired (after the handshake
    /// for secure connections).
    opened: bool,
    /// Graceful close in progress; force-close after this instant.
    closing_deadline: Option<Instant>,
    deregistration_requested: bool,
    deregistered: bool,
    cause: Option<Error>,
    /// Kind and message of the first failure, kept for `wait_connected`.
    failure: Option<(io::ErrorKind, String)>,
    timed_out: Option<TimeoutKind>,
}

struct Timeouts {
    created: Instant,
    last_received: Instant,
    idle: Option<Duration>,
    connection: Option<Duration>,
    /// The handler chose to keep the connection past its lifetime.
    connection_kept: bool,
    close: Duration,
}

struct Inner {
    id: u64,
    socket: SocketHandle,
    recv: Mutex<ChunkQueue>,
    data_ready: Condvar,
    send: Mutex<ChunkQueue>,
    secure: Option<Mutex<SecureSession>>,
    handler: Mutex<HandlerSlot>,
    /// Installed before the next callback runs.
    pending_handler: Mutex<Option<Box<dyn Handler>>>,
    state: Mutex<Lifecycle>,
    state_changed: Condvar,
    timeouts: Mutex<Timeouts>,
    open: AtomicBool,
    connected: AtomicBool,
    flush_queued: AtomicBool,
    suspended: AtomicBool,
    throttled: AtomicBool,
    read_threshold: AtomicUsize,
}

/// Outcome of handing one received chunk to the connection.
struct Ingest {
    plaintext: bool,
    peer_closed: bool,
}

/// Handle to a connection. Cheap to clone; clones compare equal.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub(crate) fn accepted(
        stream: mio::net::TcpStream,
        dispatcher: DispatcherHandle,
        factory: &dyn HandlerFactory,
        tls: Option<&TlsServer>,
    ) -> Result<Connection> {
        let session = tls.map(TlsServer::session).transpose()?;
        let conn = Self::build(stream, dispatcher, None, session, true);
        conn.install(factory);
        Ok(conn)
    }

    /// Outbound connection. `connected` is false while a non-blocking
    /// connect is still in flight.
    pub(crate) fn outbound(
        stream: mio::net::TcpStream,
        dispatcher: DispatcherHandle,
        peer: SocketAddr,
        factory: &dyn HandlerFactory,
        tls: Option<&TlsClient>,
        connected: bool,
    ) -> Result<Connection> {
        let session = tls.map(TlsClient::session).transpose()?;
        let conn = Self::build(stream, dispatcher, Some(peer), session, connected);
        conn.install(factory);
        Ok(conn)
    }

    fn build(
        stream: mio::net::TcpStream,
        dispatcher: DispatcherHandle,
        peer: Option<SocketAddr>,
        session: Option<SecureSession>,
        connected: bool,
    ) -> Connection {
        let config = dispatcher.config();
        let now = Instant::now();
        let timeouts = Timeouts {
            created: now,
            last_received: now,
            idle: config.idle_timeout,
            connection: config.connection_timeout,
            connection_kept: false,
            close: config.close_timeout,
        };

        Connection {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                socket: SocketHandle::new(stream, dispatcher, peer),
                recv: Mutex::new(ChunkQueue::new()),
                data_ready: Condvar::new(),
                send: Mutex::new(ChunkQueue::new()),
                secure: session.map(Mutex::new),
                handler: Mutex::new(HandlerSlot::new(Box::new(NoopHandler))),
                pending_handler: Mutex::new(None),
                state: Mutex::new(Lifecycle::default()),
                state_changed: Condvar::new(),
                timeouts: Mutex::new(timeouts),
                open: AtomicBool::new(true),
                connected: AtomicBool::new(connected),
                flush_queued: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                throttled: AtomicBool::new(false),
                read_threshold: AtomicUsize::new(NO_THRESHOLD),
            }),
        }
    }

    fn install(&self, factory: &dyn HandlerFactory) {
        let handler = factory.new_handler(self);
        self.inner.handler.lock().replace(handler);
    }

    // ---- identity and state ----

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Id of the dispatcher this connection is pinned to.
    pub fn dispatcher_id(&self) -> usize {
        self.inner.socket.dispatcher().id()
    }

    /// False once any close has been requested.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// TCP connection established.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_secure(&self) -> bool {
        self.inner.secure.is_some()
    }

    /// Always true for plain connections.
    pub fn is_handshake_complete(&self) -> bool {
        match &self.inner.secure {
            Some(secure) => secure.lock().is_finished(),
            None => true,
        }
    }

    /// Which timeout closed this connection, if any.
    pub fn timed_out(&self) -> Option<TimeoutKind> {
        self.inner.state.lock().timed_out
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.socket.bytes_received()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.socket.bytes_sent()
    }

    /// Swap the handler. Capabilities are resolved again for the new one.
    /// Must not be called from inside one of this connection's callbacks.
    pub fn set_handler(&self, handler: Box<dyn Handler>) -> Box<dyn Handler> {
        self.inner.handler.lock().replace(handler)
    }

    /// Like `set_handler`, but safe to call from inside any callback: on the
    /// dispatcher thread the swap is deferred to the next callback.
    pub(crate) fn reset_handler(&self, handler: Box<dyn Handler>) {
        if self.inner.socket.dispatcher().is_current() {
            *self.inner.pending_handler.lock() = Some(handler);
        } else {
            self.inner.handler.lock().replace(handler);
            self.inner.pending_handler.lock().take();
        }
    }

    // ---- writes ----

    /// Queue bytes for sending. Returns the number of bytes accepted.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }

        match &self.inner.secure {
            Some(secure) => {
                let mut session = secure.lock();
                let mut send = self.inner.send.lock();
                session.send(data, &mut send)?;
            }
            None => self.inner.send.lock().push(data),
        }

        self.request_flush();
        Ok(len)
    }

    pub fn write_str(&self, s: &str) -> Result<usize> {
        self.write(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn write_u8(&self, v: u8) -> Result<usize> {
        self.write(Bytes::copy_from_slice(&[v]))
    }

    /// Network byte order.
    pub fn write_i32(&self, v: i32) -> Result<usize> {
        self.write(Bytes::copy_from_slice(&v.to_be_bytes()))
    }

    pub fn write_i64(&self, v: i64) -> Result<usize> {
        self.write(Bytes::copy_from_slice(&v.to_be_bytes()))
    }

    pub fn write_f64(&self, v: f64) -> Result<usize> {
        self.write(Bytes::copy_from_slice(&v.to_be_bytes()))
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_write_bytes(&self) -> usize {
        self.inner.send.lock().len()
    }

    // ---- reads ----

    /// Bytes buffered in the receive queue.
    pub fn available(&self) -> usize {
        self.inner.recv.lock().len()
    }

    /// Everything currently buffered.
    pub fn read_available(&self) -> Bytes {
        self.with_recv(|q| Ok(join(q.drain_all()))).unwrap_or_default()
    }

    pub fn read_bytes_by_length(&self, n: usize) -> Result<Bytes> {
        self.with_recv(|q| q.read_bytes(n))
    }

    pub fn read_string_by_length(&self, n: usize) -> Result<String> {
        let bytes = self.read_bytes_by_length(n)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Content up to `delimiter`; the delimiter itself is consumed and dropped.
    pub fn read_bytes_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes> {
        self.read_bytes_by_delimiter_max(delimiter, usize::MAX)
    }

    /// Like `read_bytes_by_delimiter`, failing with `MaxReadSizeExceeded`
    /// once more than `max_len` content bytes would be needed.
    pub fn read_bytes_by_delimiter_max(&self, delimiter: &[u8], max_len: usize) -> Result<Bytes> {
        self.with_recv(|q| q.read_by_delimiter(delimiter, max_len).map(join))
    }

    pub fn read_string_by_delimiter(&self, delimiter: &str) -> Result<String> {
        self.read_string_by_delimiter_max(delimiter, usize::MAX)
    }

    pub fn read_string_by_delimiter_max(&self, delimiter: &str, max_len: usize) -> Result<String> {
        let bytes = self.read_bytes_by_delimiter_max(delimiter.as_bytes(), max_len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn read_u8(&self) -> Result<u8> {
        Ok(self.read_bytes_by_length(1)?.get_u8())
    }

    /// Network byte order.
    pub fn read_i32(&self) -> Result<i32> {
        Ok(self.read_bytes_by_length(4)?.get_i32())
    }

    pub fn read_i64(&self) -> Result<i64> {
        Ok(self.read_bytes_by_length(8)?.get_i64())
    }

    pub fn read_f64(&self) -> Result<f64> {
        Ok(self.read_bytes_by_length(8)?.get_f64())
    }

    /// Offset of `delimiter` from the head of the receive queue.
    pub fn index_of(&self, delimiter: &[u8]) -> Option<usize> {
        self.inner.recv.lock().index_of(delimiter)
    }

    /// Remember the current read position. Everything consumed afterwards
    /// can be put back with `reset_to_read_mark`.
    pub fn mark_read_position(&self) {
        self.inner.recv.lock().mark();
    }

    /// Returns false if no mark was set.
    pub fn reset_to_read_mark(&self) -> bool {
        self.inner.recv.lock().reset_to_mark()
    }

    pub fn remove_read_mark(&self) {
        self.inner.recv.lock().remove_mark();
    }

    /// Block until `delimiter` arrives or `timeout` elapses.
    /// Must not be called on the connection's dispatcher thread.
    pub fn read_string_by_delimiter_timeout(&self, delimiter: &str, timeout: Duration) -> Result<String> {
        let bytes = self.wait_read(timeout, |q| {
            q.read_by_delimiter(delimiter.as_bytes(), usize::MAX).map(join)
        })?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Block until `n` bytes are buffered or `timeout` elapses.
    pub fn read_bytes_by_length_timeout(&self, n: usize, timeout: Duration) -> Result<Bytes> {
        self.wait_read(timeout, |q| q.read_bytes(n))
    }

    fn with_recv<R>(&self, f: impl FnOnce(&mut ChunkQueue) -> Result<R>) -> Result<R> {
        let (result, remaining) = {
            let mut queue = self.inner.recv.lock();
            let result = f(&mut queue);
            (result, queue.len())
        };
        if result.is_ok() {
            self.after_consume(remaining);
        }
        result
    }

    fn wait_read<R>(&self, timeout: Duration, mut f: impl FnMut(&mut ChunkQueue) -> Result<R>) -> Result<R> {
        if self.inner.socket.dispatcher().is_current() {
            return self.with_recv(f);
        }

        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.recv.lock();
        loop {
            match f(&mut queue) {
                Err(e) if e.is_insufficient_data() => {}
                other => {
                    let remaining = queue.len();
                    drop(queue);
                    if other.is_ok() {
                        self.after_consume(remaining);
                    }
                    return other;
                }
            }
            if !self.is_open() {
                return Err(Error::Closed);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            self.inner.data_ready.wait_until(&mut queue, deadline);
        }
    }

    /// Resume socket reads once the application drained below the threshold.
    fn after_consume(&self, remaining: usize) {
        let threshold = self.inner.read_threshold.load(Ordering::Relaxed);
        if remaining < threshold && self.inner.throttled.swap(false, Ordering::AcqRel) {
            self.request_resume();
        }
    }

    // ---- flow control ----

    /// Stop reading from the socket. Already buffered data stays readable.
    pub fn suspend_receiving(&self) {
        self.inner.suspended.store(true, Ordering::Release);
    }

    pub fn resume_receiving(&self) {
        if self.inner.suspended.swap(false, Ordering::AcqRel) {
            self.request_resume();
        }
    }

    pub fn is_receiving_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    /// Pause socket reads while at least `limit` bytes are buffered.
    /// `None` removes the limit.
    pub fn set_max_read_buffer_threshold(&self, limit: Option<usize>) {
        let limit = limit.unwrap_or(NO_THRESHOLD);
        self.inner.read_threshold.store(limit, Ordering::Relaxed);
        let buffered = self.available();
        self.after_consume(buffered);
    }

    pub fn max_read_buffer_threshold(&self) -> Option<usize> {
        match self.inner.read_threshold.load(Ordering::Relaxed) {
            NO_THRESHOLD => None,
            n => Some(n),
        }
    }

    fn receive_blocked(&self) -> bool {
        if self.inner.suspended.load(Ordering::Acquire) {
            return true;
        }
        let threshold = self.inner.read_threshold.load(Ordering::Relaxed);
        if threshold == NO_THRESHOLD {
            return false;
        }
        let recv = self.inner.recv.lock();
        if recv.len() >= threshold {
            // Set under the lock so a concurrent drain always sees it.
            self.inner.throttled.store(true, Ordering::Release);
            return true;
        }
        false
    }

    // ---- timeouts ----

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.timeouts.lock().idle
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        let mut t = self.inner.timeouts.lock();
        t.idle = timeout;
        t.last_received = Instant::now();
    }

    /// Maximum lifetime, measured from creation.
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.inner.timeouts.lock().connection
    }

    pub fn set_connection_timeout(&self, timeout: Option<Duration>) {
        let mut t = self.inner.timeouts.lock();
        t.connection = timeout;
        t.connection_kept = false;
    }

    pub fn remaining_idle_time(&self) -> Option<Duration> {
        let t = self.inner.timeouts.lock();
        t.idle.map(|d| d.saturating_sub(t.last_received.elapsed()))
    }

    pub fn remaining_connection_time(&self) -> Option<Duration> {
        let t = self.inner.timeouts.lock();
        t.connection.map(|d| d.saturating_sub(t.created.elapsed()))
    }

    fn touch(&self) {
        self.inner.timeouts.lock().last_received = Instant::now();
    }

    // ---- close ----

    /// Graceful close: pending writes are drained first, bounded by the
    /// configured close timeout. Idempotent.
    pub fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(conn_id = self.inner.id, "Closing connection");

        // No handshake has run, so there is nothing to drain securely.
        if !self.is_connected() && self.is_secure() {
            self.notify_waiters();
            self.request_deregistration();
            return;
        }

        // A plain connect still in flight drains once it completes.
        if let Some(secure) = &self.inner.secure {
            let mut session = secure.lock();
            let mut send = self.inner.send.lock();
            if let Err(e) = session.close_outbound(&mut send) {
                debug!(conn_id = self.inner.id, error = %e, "Failed to emit close notify");
            }
        }

        let close_timeout = self.inner.timeouts.lock().close;
        self.inner.state.lock().closing_deadline = Some(Instant::now() + close_timeout);
        self.notify_waiters();
        self.inner.flush_queued.store(false, Ordering::Release);
        self.request_flush();
    }

    /// Close without draining; pending writes are discarded. Idempotent.
    pub fn close_immediately(&self) {
        self.inner.open.store(false, Ordering::Release);
        self.inner.send.lock().clear();
        self.notify_waiters();
        self.request_deregistration();
    }

    /// Wait until the connection is ready for application traffic:
    /// connected, and for secure connections handshaken.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.opened {
                return Ok(());
            }
            if state.deregistered || !self.is_open() {
                let (kind, message) = state
                    .failure
                    .clone()
                    .unwrap_or((io::ErrorKind::ConnectionAborted, "connection closed".to_string()));
                return Err(Error::Connect {
                    addr: self.peer_or_unspecified(),
                    source: io::Error::new(kind, message),
                });
            }
            if Instant::now() >= deadline || self.inner.socket.dispatcher().is_current() {
                return Err(Error::Timeout(timeout));
            }
            self.inner.state_changed.wait_until(&mut state, deadline);
        }
    }

    fn peer_or_unspecified(&self) -> SocketAddr {
        self.peer_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    fn notify_waiters(&self) {
        // Taking each lock orders this notification after any waiter's check.
        drop(self.inner.recv.lock());
        self.inner.data_ready.notify_all();
        drop(self.inner.state.lock());
        self.inner.state_changed.notify_all();
    }

    fn request_deregistration(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.deregistration_requested {
                return;
            }
            state.deregistration_requested = true;
        }
        self.inner.socket.dispatcher().deregister_and_close(self);
    }

    fn request_flush(&self) {
        let dispatcher = self.inner.socket.dispatcher();
        if !dispatcher.is_current() && self.inner.flush_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        dispatcher.update_interest(self, KeyUpdate::Flush);
    }

    fn request_resume(&self) {
        self.inner.socket.dispatcher().update_interest(self, KeyUpdate::Resume);
    }

    // ---- dispatcher side ----

    pub(crate) fn socket(&self) -> &SocketHandle {
        &self.inner.socket
    }

    /// A connect in flight also waits for writability.
    pub(crate) fn needs_write_interest(&self) -> bool {
        !self.is_connected() || !self.inner.send.lock().is_empty()
    }

    /// Close immediately, remembering `err` as the cause.
    pub(crate) fn fail(&self, err: Error) {
        {
            let mut state = self.inner.state.lock();
            if state.failure.is_none() {
                let kind = match &err {
                    Error::Io(e) | Error::Connect { source: e, .. } => e.kind(),
                    Error::Timeout(_) => io::ErrorKind::TimedOut,
                    _ => io::ErrorKind::Other,
                };
                state.failure = Some((kind, err.to_string()));
            }
            if state.cause.is_none() && !state.deregistered {
                state.cause = Some(err);
            }
        }
        self.close_immediately();
    }

    pub(crate) fn deregistration_requested(&self) -> bool {
        self.inner.state.lock().deregistration_requested
    }

    /// Now in the dispatcher's handle table.
    pub(crate) fn on_registered(&self) -> Result<()> {
        // A flush queued before the handle was known was dropped as stale;
        // the flush below covers it.
        self.inner.flush_queued.store(false, Ordering::Release);
        if !self.is_open() {
            return self.flush();
        }
        if self.is_connected() {
            self.transport_ready()?;
            self.on_readable()?;
        }
        self.flush()
    }

    pub(crate) fn on_readable(&self) -> Result<()> {
        if !self.is_connected() || self.inner.socket.is_closed() {
            return Ok(());
        }

        let mut received = false;
        let mut eof = false;
        while !self.receive_blocked() {
            match self.inner.socket.read()? {
                ReadOutcome::Data(chunk) => {
                    let ingest = self.ingest(chunk)?;
                    received |= ingest.plaintext;
                    if ingest.peer_closed {
                        eof = true;
                        break;
                    }
                }
                ReadOutcome::Eof => {
                    eof = true;
                    break;
                }
                ReadOutcome::WouldBlock => break,
            }
        }

        if received {
            self.touch();
            drop(self.inner.recv.lock());
            self.inner.data_ready.notify_all();
            self.deliver_data()?;
        }

        if eof {
            debug!(conn_id = self.inner.id, "Peer closed connection");
            self.close_immediately();
        }
        Ok(())
    }

    fn ingest(&self, chunk: Bytes) -> Result<Ingest> {
        let Some(secure) = &self.inner.secure else {
            self.inner.recv.lock().push(chunk);
            return Ok(Ingest {
                plaintext: true,
                peer_closed: false,
            });
        };

        let (progress, plaintext, pending) = {
            let mut session = secure.lock();
            let mut send = self.inner.send.lock();
            let mut recv = self.inner.recv.lock();
            let before = recv.len();
            let progress = session.receive(&chunk, &mut recv, &mut send)?;
            (progress, recv.len() > before, !send.is_empty())
        };

        if progress.finished {
            self.opened()?;
        }
        if pending {
            self.flush()?;
        }
        Ok(Ingest {
            plaintext,
            peer_closed: progress.peer_closed,
        })
    }

    fn deliver_data(&self) -> Result<()> {
        if self.inner.recv.lock().is_empty() {
            return Ok(());
        }
        match self.with_handler(Capabilities::DATA, |h, conn| h.on_data(conn)) {
            Some(Err(e)) if !e.is_insufficient_data() => Err(e),
            _ => Ok(()),
        }
    }

    pub(crate) fn on_writable(&self) -> Result<()> {
        if !self.is_connected() {
            match self.inner.socket.finish_connect() {
                Ok(false) => return Ok(()),
                Ok(true) => {
                    self.inner.connected.store(true, Ordering::Release);
                    debug!(conn_id = self.inner.id, peer = ?self.peer_addr(), "Connected");
                    self.transport_ready()?;
                }
                Err(source) => {
                    return Err(Error::Connect {
                        addr: self.peer_or_unspecified(),
                        source,
                    });
                }
            }
        }
        self.flush()
    }

    pub(crate) fn apply_key_update(&self, update: KeyUpdate) -> Result<()> {
        match update {
            KeyUpdate::Flush => {
                self.inner.flush_queued.store(false, Ordering::Release);
                self.flush()
            }
            KeyUpdate::Resume => self.on_readable(),
        }
    }

    /// TCP is up: start the handshake, or open right away for plain connections.
    fn transport_ready(&self) -> Result<()> {
        let Some(secure) = &self.inner.secure else {
            return self.opened();
        };
        let finished = {
            let mut session = secure.lock();
            let mut send = self.inner.send.lock();
            session.begin(&mut send)?
        };
        if finished {
            self.opened()?;
        }
        Ok(())
    }

    fn opened(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.opened {
                return Ok(());
            }
            state.opened = true;
        }
        self.inner.state_changed.notify_all();

        if !self.is_open() {
            return Ok(());
        }
        debug!(conn_id = self.inner.id, secure = self.is_secure(), "Connection opened");
        match self.with_handler(Capabilities::CONNECT, |h, conn| h.on_connect(conn)) {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Write as much of the send queue as the socket takes and sync write
    /// interest with what is left. Dispatcher thread only.
    fn flush(&self) -> Result<()> {
        if !self.is_connected() || self.inner.socket.is_closed() {
            return Ok(());
        }

        let remaining = {
            let mut send = self.inner.send.lock();
            if !send.is_empty() {
                self.inner.socket.write_from(&mut send)?;
            }
            send.len()
        };

        let registry = self.inner.socket.dispatcher().registry();
        self.inner.socket.set_write_interest(registry, remaining > 0)?;

        if remaining == 0 && self.inner.state.lock().closing_deadline.is_some() {
            self.inner.socket.shutdown_write();
            self.request_deregistration();
        }
        Ok(())
    }

    pub(crate) fn on_sweep(&self, now: Instant) {
        let closing = self.inner.state.lock().closing_deadline;
        if let Some(deadline) = closing {
            if now >= deadline {
                debug!(
                    conn_id = self.inner.id,
                    pending = self.pending_write_bytes(),
                    "Graceful close timed out"
                );
                self.close_immediately();
            }
            return;
        }
        if !self.is_open() {
            return;
        }

        let (idle, lifetime) = {
            let t = self.inner.timeouts.lock();
            let idle = t
                .idle
                .filter(|d| now.saturating_duration_since(t.last_received) >= *d);
            let lifetime = t
                .connection
                .filter(|d| !t.connection_kept && now.saturating_duration_since(t.created) >= *d);
            (idle, lifetime)
        };

        if let Some(timeout) = idle {
            let keep = self
                .with_handler(Capabilities::IDLE_TIMEOUT, |h, conn| h.on_idle_timeout(conn))
                .unwrap_or(false);
            if keep {
                self.touch();
            } else {
                debug!(conn_id = self.inner.id, ?timeout, "Idle timeout");
                self.inner.state.lock().timed_out = Some(TimeoutKind::Idle);
                self.fail(Error::Timeout(timeout));
                return;
            }
        }

        if let Some(timeout) = lifetime {
            let keep = self
                .with_handler(Capabilities::CONNECTION_TIMEOUT, |h, conn| {
                    h.on_connection_timeout(conn)
                })
                .unwrap_or(false);
            if keep {
                self.inner.timeouts.lock().connection_kept = true;
            } else {
                debug!(conn_id = self.inner.id, ?timeout, "Connection timeout");
                self.inner.state.lock().timed_out = Some(TimeoutKind::Connection);
                self.fail(Error::Timeout(timeout));
            }
        }
    }

    /// Removed from the dispatcher: release the socket and fire
    /// `on_disconnect` exactly once.
    pub(crate) fn on_deregistered(&self) {
        let cause = {
            let mut state = self.inner.state.lock();
            if state.deregistered {
                return;
            }
            state.deregistered = true;
            state.deregistration_requested = true;
            state.cause.take()
        };

        self.inner.open.store(false, Ordering::Release);
        self.inner.socket.close();
        self.notify_waiters();

        debug!(
            conn_id = self.inner.id,
            received = self.bytes_received(),
            sent = self.bytes_sent(),
            "Connection closed"
        );
        self.with_handler(Capabilities::DISCONNECT, |h, conn| {
            h.on_disconnect(conn, cause.as_ref())
        });
    }

    fn with_handler<R>(&self, capability: Capabilities, f: impl FnOnce(&mut dyn Handler, &Connection) -> R) -> Option<R> {
        let mut slot = self.inner.handler.lock();
        let pending = self.inner.pending_handler.lock().take();
        if let Some(handler) = pending {
            slot.replace(handler);
        }
        if !slot.has(capability) {
            return None;
        }
        Some(f(slot.handler(), self))
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.peer_addr())
            .field("open", &self.is_open())
            .field("secure", &self.is_secure())
            .finish()
    }
}
