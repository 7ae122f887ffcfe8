//! Reactor loop: one readiness multiplexer per thread.
//!
//! The `Poll`, the handle table and every socket's interest bits are
//! written only by the dispatcher's own thread. Other threads talk to it
//! through three channels (registrations, key updates, deregistrations)
//! followed by a `Waker` nudge. A caller already running on the dispatcher
//! thread skips the round-trip and mutates the multiplexer directly.
//!
//! One pass of the loop:
//!
//! ```text
//! poll (bounded) -> registrations -> key updates -> ready events
//!                -> deregistrations -> timeout sweep
//! ```
//!
//! Deregistration always runs last so closing a connection never disturbs
//! the event batch that is still being dispatched.

use crate::config::DispatcherConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::runtime::buffer::ReadAllocator;
use crate::runtime::registry::HandleRegistry;
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Instant;
use tracing::{debug, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// Interest changes requested for a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyUpdate {
    /// Drain the send queue and sync write interest with what is left.
    Flush,
    /// Receiving was resumed; read whatever is already buffered in the kernel.
    Resume,
}

struct Registration {
    conn: Connection,
    /// Already added to the multiplexer by the fast path.
    armed: bool,
}

struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

#[derive(Default)]
struct Counters {
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    registered: AtomicUsize,
}

/// Read-only snapshot of one dispatcher's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub id: usize,
    /// Handles currently registered.
    pub registered: usize,
    pub registrations: u64,
    pub deregistrations: u64,
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Receive buffers allocated by this dispatcher's reader.
    pub read_buffer_allocations: u64,
}

struct Shared {
    id: usize,
    owner: OnceLock<ThreadId>,
    registry: Registry,
    waker: Waker,
    registrations: Queue<Registration>,
    key_updates: Queue<(Token, KeyUpdate)>,
    deregistrations: Queue<Token>,
    /// Accepting registrations.
    open: AtomicBool,
    /// `close()` was requested.
    shutdown: AtomicBool,
    /// The loop has exited.
    terminated: AtomicBool,
    next_token: AtomicUsize,
    allocator: Mutex<ReadAllocator>,
    config: DispatcherConfig,
    counters: Counters,
}

/// Cloneable reference to a dispatcher, usable from any thread.
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// True when called from this dispatcher's own thread.
    pub fn is_current(&self) -> bool {
        self.shared.owner.get() == Some(&thread::current().id())
    }

    /// Still accepting registrations.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.shared.counters;
        DispatcherStats {
            id: self.shared.id,
            registered: c.registered.load(Ordering::Relaxed),
            registrations: c.registrations.load(Ordering::Relaxed),
            deregistrations: c.deregistrations.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            read_buffer_allocations: self.with_allocator(|a| a.allocations()),
        }
    }

    /// Stop accepting registrations and ask the loop to close every
    /// handle. The loop exits once all handles are gone or the shutdown
    /// grace period has elapsed.
    pub fn close(&self) {
        self.shared.open.store(false, Ordering::Release);
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            debug!(dispatcher = self.shared.id, "Dispatcher close requested");
        }
        self.wake();
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Hand a connection to this dispatcher.
    pub(crate) fn register(&self, conn: Connection) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DispatcherClosed(self.shared.id));
        }

        let armed = self.is_current();
        if armed {
            conn.socket().register(&self.shared.registry, conn.needs_write_interest())?;
        }
        self.shared
            .registrations
            .tx
            .send(Registration { conn, armed })
            .map_err(|_| Error::DispatcherClosed(self.shared.id))?;
        if !armed {
            self.wake();
        }
        Ok(())
    }

    /// Apply `update` now on the dispatcher thread, or queue it.
    pub(crate) fn update_interest(&self, conn: &Connection, update: KeyUpdate) {
        if self.is_current() && update == KeyUpdate::Flush {
            if let Err(e) = conn.apply_key_update(update) {
                debug!(conn_id = conn.id(), error = %e, "Connection error");
                conn.fail(e);
            }
            return;
        }

        let token = conn.socket().token();
        if self.shared.key_updates.tx.send((token, update)).is_ok() {
            self.wake();
        }
    }

    /// Queue removal of a connection. Always applied at the end of a pass.
    pub(crate) fn deregister_and_close(&self, conn: &Connection) {
        if self.shared.terminated.load(Ordering::Acquire) {
            // Nobody left to drain the queue.
            conn.on_deregistered();
            return;
        }
        if self.shared.deregistrations.tx.send(conn.socket().token()).is_ok() && !self.is_current() {
            self.wake();
        }
    }

    pub(crate) fn with_allocator<R>(&self, f: impl FnOnce(&mut ReadAllocator) -> R) -> R {
        f(&mut self.shared.allocator.lock())
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.shared.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.shared.counters.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.shared.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.shared.counters.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!(dispatcher = self.shared.id, error = %e, "Failed to wake dispatcher");
        }
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("id", &self.shared.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// The loop itself. Moved onto its own thread by `run`.
pub struct Dispatcher {
    poll: Poll,
    events: Events,
    handles: HandleRegistry<Connection>,
    shared: Arc<Shared>,
    last_sweep: Instant,
    shutdown_started: Option<Instant>,
}

impl Dispatcher {
    pub fn new(id: usize, config: DispatcherConfig) -> io::Result<(Dispatcher, DispatcherHandle)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            id,
            owner: OnceLock::new(),
            registry,
            waker,
            registrations: Queue::new(),
            key_updates: Queue::new(),
            deregistrations: Queue::new(),
            open: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            next_token: AtomicUsize::new(0),
            allocator: Mutex::new(ReadAllocator::new(&config.read_buffer)),
            config,
            counters: Counters::default(),
        });

        let dispatcher = Dispatcher {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            handles: HandleRegistry::new(),
            shared: Arc::clone(&shared),
            last_sweep: Instant::now(),
            shutdown_started: None,
        };
        Ok((dispatcher, DispatcherHandle { shared }))
    }

    /// Run until `close()` completes. Must be called on the thread that
    /// will own this dispatcher.
    pub fn run(mut self) {
        let id = self.shared.id;
        let _ = self.shared.owner.set(thread::current().id());
        info!(dispatcher = id, "Dispatcher started");

        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(self.shared.config.poll_timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(dispatcher = id, error = %e, "Poll failed");
                }
            }

            self.drain_registrations();
            self.drain_key_updates();
            self.dispatch_events();
            self.drain_deregistrations();

            let now = Instant::now();
            if now.duration_since(self.last_sweep) >= self.shared.config.sweep_interval {
                self.sweep(now);
                self.last_sweep = now;
            }

            if self.shared.shutdown.load(Ordering::Acquire) && self.shutdown_step(now) {
                break;
            }
        }

        self.force_close_all();
        info!(dispatcher = id, "Dispatcher stopped");
    }

    fn drain_registrations(&mut self) {
        while let Ok(Registration { conn, armed }) = self.shared.registrations.rx.try_recv() {
            if !armed {
                if let Err(e) = conn.socket().register(&self.shared.registry, conn.needs_write_interest()) {
                    warn!(dispatcher = self.shared.id, conn_id = conn.id(), error = %e, "Registration failed");
                    conn.fail(e.into());
                    conn.on_deregistered();
                    continue;
                }
            }

            let token = conn.socket().token();
            self.handles.insert(token, conn.clone());
            self.shared.counters.registrations.fetch_add(1, Ordering::Relaxed);
            self.shared.counters.registered.store(self.handles.len(), Ordering::Relaxed);

            // Closed while the registration was queued; its deregistration
            // token may already have been drained.
            if conn.deregistration_requested() {
                self.remove(token);
                continue;
            }

            if let Err(e) = conn.on_registered() {
                debug!(conn_id = conn.id(), error = %e, "Connection error");
                conn.fail(e);
            }
        }
    }

    fn drain_key_updates(&mut self) {
        while let Ok((token, update)) = self.shared.key_updates.rx.try_recv() {
            // Stale updates for closed handles are expected
            let Some(conn) = self.handles.get(token).cloned() else {
                continue;
            };
            if let Err(e) = conn.apply_key_update(update) {
                debug!(conn_id = conn.id(), error = %e, "Connection error");
                conn.fail(e);
            }
        }
    }

    fn dispatch_events(&mut self) {
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let Some(conn) = self.handles.get(token).cloned() else {
                continue;
            };

            if event.is_readable() || event.is_read_closed() || event.is_error() {
                if let Err(e) = conn.on_readable() {
                    debug!(conn_id = conn.id(), error = %e, "Connection error");
                    conn.fail(e);
                    continue;
                }
            }

            if event.is_writable() || event.is_error() {
                if let Err(e) = conn.on_writable() {
                    debug!(conn_id = conn.id(), error = %e, "Connection error");
                    conn.fail(e);
                }
            }
        }
    }

    fn drain_deregistrations(&mut self) {
        while let Ok(token) = self.shared.deregistrations.rx.try_recv() {
            self.remove(token);
        }
    }

    fn remove(&mut self, token: Token) {
        let Some(conn) = self.handles.remove(token) else {
            return;
        };
        conn.socket().deregister(&self.shared.registry);
        self.shared.counters.deregistrations.fetch_add(1, Ordering::Relaxed);
        self.shared.counters.registered.store(self.handles.len(), Ordering::Relaxed);
        conn.on_deregistered();
    }

    fn sweep(&mut self, now: Instant) {
        let conns: Vec<Connection> = self.handles.iter().map(|(_, c)| c.clone()).collect();
        for conn in conns {
            conn.on_sweep(now);
        }
        // Timeouts close immediately; apply them in this pass.
        self.drain_deregistrations();
    }

    /// Returns true once the loop may exit.
    fn shutdown_step(&mut self, now: Instant) -> bool {
        let started = *self.shutdown_started.get_or_insert_with(|| {
            info!(
                dispatcher = self.shared.id,
                handles = self.handles.len(),
                "Dispatcher shutting down"
            );
            now
        });

        let conns: Vec<Connection> = self.handles.iter().map(|(_, c)| c.clone()).collect();
        for conn in conns {
            conn.close();
        }
        self.drain_deregistrations();

        if self.handles.is_empty() && self.shared.registrations.rx.is_empty() {
            return true;
        }
        if now.duration_since(started) >= self.shared.config.shutdown_grace {
            warn!(
                dispatcher = self.shared.id,
                remaining = self.handles.len(),
                "Shutdown grace period elapsed, force-closing connections"
            );
            return true;
        }
        false
    }

    fn force_close_all(&mut self) {
        self.shared.open.store(false, Ordering::Release);

        while let Ok(Registration { conn, .. }) = self.shared.registrations.rx.try_recv() {
            conn.fail(Error::DispatcherClosed(self.shared.id));
            conn.on_deregistered();
        }
        for (_, conn) in self.handles.drain() {
            conn.fail(Error::DispatcherClosed(self.shared.id));
            conn.socket().deregister(&self.shared.registry);
            self.shared.counters.deregistrations.fetch_add(1, Ordering::Relaxed);
            conn.on_deregistered();
        }
        self.shared.counters.registered.store(0, Ordering::Relaxed);
        self.shared.terminated.store(true, Ordering::Release);

        // Anything queued between the drain above and `terminated`.
        while let Ok(Registration { conn, .. }) = self.shared.registrations.rx.try_recv() {
            conn.fail(Error::DispatcherClosed(self.shared.id));
            conn.on_deregistered();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Handler, NoopHandler};
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn spawn(id: usize) -> (DispatcherHandle, thread::JoinHandle<()>) {
        let config = DispatcherConfig {
            shutdown_grace: Duration::from_millis(200),
            ..DispatcherConfig::default()
        };
        let (dispatcher, handle) = Dispatcher::new(id, config).unwrap();
        let thread = thread::Builder::new()
            .name(format!("dispatcher-{id}"))
            .spawn(move || dispatcher.run())
            .unwrap();
        (handle, thread)
    }

    #[test]
    fn test_tokens_are_not_reused() {
        let (_dispatcher, handle) = Dispatcher::new(0, DispatcherConfig::default()).unwrap();
        let a = handle.next_token();
        let b = handle.next_token();
        assert_ne!(a, b);
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_is_current_only_on_owner_thread() {
        let (handle, thread) = spawn(3);
        assert!(!handle.is_current());

        // Wait for the loop to record its owner.
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.shared.owner.get().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.shared.owner.get().is_some());
        assert!(!handle.is_current());

        handle.close();
        thread.join().unwrap();
    }

    #[test]
    fn test_close_stops_registrations_and_loop() {
        let (handle, thread) = spawn(7);
        assert!(handle.is_open());

        handle.close();
        assert!(!handle.is_open());
        thread.join().unwrap();

        let stats = handle.stats();
        assert_eq!(stats.id, 7);
        assert_eq!(stats.registered, 0);
        assert!(handle.shared.terminated.load(Ordering::Acquire));
    }

    /// A loopback connection built against `handle` but not yet registered.
    fn loopback(handle: &DispatcherHandle, factory: &dyn crate::connection::HandlerFactory) -> (TcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let conn = Connection::accepted(
            mio::net::TcpStream::from_std(stream),
            handle.clone(),
            factory,
            None,
        )
        .unwrap();
        (client, conn)
    }

    struct CountDisconnects(Arc<AtomicUsize>);

    impl Handler for CountDisconnects {
        fn on_disconnect(&mut self, _conn: &Connection, _cause: Option<&Error>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_deregistration_drained_before_its_registration() {
        let (mut dispatcher, handle) = Dispatcher::new(0, DispatcherConfig::default()).unwrap();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        let (_client, conn) = loopback(&handle, &move |_: &Connection| {
            CountDisconnects(Arc::clone(&counter))
        });

        handle.register(conn.clone()).unwrap();
        conn.close_immediately();

        dispatcher.drain_deregistrations();
        dispatcher.drain_registrations();
        dispatcher.drain_deregistrations();

        assert!(dispatcher.handles.is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        let stats = handle.stats();
        assert_eq!(stats.registered, 0);
        assert_eq!(stats.registrations, 1);
        assert_eq!(stats.deregistrations, 1);
    }

    #[test]
    fn test_flush_drained_before_its_registration() {
        let (mut dispatcher, handle) = Dispatcher::new(0, DispatcherConfig::default()).unwrap();
        let (mut client, conn) = loopback(&handle, &|_: &Connection| NoopHandler);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        handle.register(conn.clone()).unwrap();
        conn.write_str("one\r\n").unwrap();

        // The flush request arrives before the handle is known.
        dispatcher.drain_key_updates();
        dispatcher.drain_registrations();

        let mut first = [0u8; 5];
        client.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"one\r\n");

        conn.write_str("two\r\n").unwrap();
        dispatcher.drain_key_updates();

        let mut second = [0u8; 5];
        client.read_exact(&mut second).unwrap();
        assert_eq!(&second, b"two\r\n");
    }
}
