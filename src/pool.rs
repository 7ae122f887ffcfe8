//! Client-side connection pool.
//!
//! Idle connections are bucketed by endpoint and by whether they are
//! secure, so a plain connection is never handed out for a TLS endpoint.
//! A borrowed connection goes back to the pool when its `PooledConnection`
//! is released or dropped, and is closed instead when it can no longer be
//! reused (closed, expired, or over the idle limit).
//!
//! Pooled connections carry a `NoopHandler`; callers drive them with the
//! blocking read helpers on `Connection`.

use crate::config::PoolConfig;
use crate::connection::{Connection, NoopHandler, TimeoutKind, TlsClient};
use crate::error::{Error, Result};
use crate::runtime::DispatcherPool;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use slab::Slab;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CONNECT_TRIALS: usize = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Idle connections closer than this to a timeout are not handed out.
const MIN_REMAINING_FOR_REUSE: Duration = Duration::from_secs(3);

type EndpointKey = (SocketAddr, bool);

/// Where pooled connections go.
#[derive(Clone)]
pub struct Endpoint {
    addr: SocketAddr,
    tls: Option<TlsClient>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, tls: None }
    }

    pub fn secure(addr: SocketAddr, tls: TlsClient) -> Self {
        Self { addr, tls: Some(tls) }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    fn key(&self) -> EndpointKey {
        (self.addr, self.is_secure())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.addr)
            .field("secure", &self.is_secure())
            .finish()
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Borrowed connections, including ones still connecting.
    pub num_active: usize,
    pub num_idle: usize,
    pub num_created: u64,
    pub num_destroyed: u64,
    /// Closed by their own idle timeout while pooled.
    pub num_idle_timeout: u64,
    /// Idle in the pool longer than `max_idle_time`.
    pub num_pool_idle_timeout: u64,
    /// Older than `max_lifetime`.
    pub num_pool_lifetime_timeout: u64,
    /// Closed by their own connection timeout while pooled.
    pub num_connection_timeout: u64,
    pub num_rejected: u64,
}

/// Why a pooled connection is being retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retire {
    Closed,
    PoolIdle,
    PoolLifetime,
    NearTimeout,
    IdleLimit,
    Destroyed,
    Shutdown,
}

struct Entry {
    conn: Connection,
    key: EndpointKey,
    created: Instant,
    /// Last time the entry went back into the pool.
    returned: Instant,
}

#[derive(Default)]
struct State {
    entries: Slab<Entry>,
    idle: HashMap<EndpointKey, Vec<usize>>,
    num_idle: usize,
    active: usize,
    active_per_endpoint: HashMap<EndpointKey, usize>,
    closed: bool,
    stats: PoolStats,
}

impl State {
    fn limit_reached(&self, key: EndpointKey, config: &PoolConfig) -> Option<usize> {
        if let Some(max) = config.max_active {
            if self.active >= max {
                return Some(max);
            }
        }
        if let Some(max) = config.max_active_per_endpoint {
            if self.active_per_endpoint.get(&key).copied().unwrap_or(0) >= max {
                return Some(max);
            }
        }
        None
    }

    fn reserve(&mut self, key: EndpointKey) {
        self.active += 1;
        *self.active_per_endpoint.entry(key).or_default() += 1;
    }

    fn unreserve(&mut self, key: EndpointKey) {
        self.active = self.active.saturating_sub(1);
        if let Some(n) = self.active_per_endpoint.get_mut(&key) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.active_per_endpoint.remove(&key);
            }
        }
    }

    fn take_idle(&mut self, key: EndpointKey) -> Option<usize> {
        let slot = self.idle.get_mut(&key)?.pop()?;
        self.num_idle -= 1;
        Some(slot)
    }

    fn push_idle(&mut self, key: EndpointKey, slot: usize) {
        self.idle.entry(key).or_default().push(slot);
        self.num_idle += 1;
    }

    /// Remove the entry and count why. The caller closes the connection
    /// once the lock is released.
    fn retire(&mut self, slot: usize, reason: Retire) -> Connection {
        let entry = self.entries.remove(slot);
        self.stats.num_destroyed += 1;
        match reason {
            Retire::Closed => match entry.conn.timed_out() {
                Some(TimeoutKind::Idle) => self.stats.num_idle_timeout += 1,
                Some(TimeoutKind::Connection) => {
                    self.stats.num_connection_timeout += 1
                }
                None => {}
            },
            Retire::PoolIdle => self.stats.num_pool_idle_timeout += 1,
            Retire::PoolLifetime => self.stats.num_pool_lifetime_timeout += 1,
            Retire::NearTimeout | Retire::IdleLimit | Retire::Destroyed | Retire::Shutdown => {}
        }
        entry.conn
    }
}

/// Whether a pooled entry has to go. `for_reuse` adds the check that the
/// connection will not time out right after being handed out.
fn expiry(entry: &Entry, config: &PoolConfig, now: Instant, for_reuse: bool) -> Option<Retire> {
    if !entry.conn.is_open() {
        return Some(Retire::Closed);
    }
    if config
        .max_lifetime
        .is_some_and(|max| now.saturating_duration_since(entry.created) >= max)
    {
        return Some(Retire::PoolLifetime);
    }
    if config
        .max_idle_time
        .is_some_and(|max| now.saturating_duration_since(entry.returned) >= max)
    {
        return Some(Retire::PoolIdle);
    }
    if for_reuse {
        let near = |remaining: Option<Duration>| remaining.is_some_and(|r| r < MIN_REMAINING_FOR_REUSE);
        if near(entry.conn.remaining_idle_time()) || near(entry.conn.remaining_connection_time()) {
            return Some(Retire::NearTimeout);
        }
    }
    None
}

fn close_all(conns: Vec<Connection>) {
    for conn in conns {
        conn.close_immediately();
    }
}

fn pooled_handler(_: &Connection) -> NoopHandler {
    NoopHandler
}

struct Sweeper {
    /// Dropping the sender stops the thread.
    _stop: Sender<()>,
    thread: JoinHandle<()>,
}

struct PoolInner {
    dispatchers: Arc<DispatcherPool>,
    config: PoolConfig,
    state: Mutex<State>,
    released: Condvar,
    sweeper: Mutex<Option<Sweeper>>,
}

impl PoolInner {
    fn acquire(self: &Arc<Self>, endpoint: &Endpoint) -> Result<PooledConnection> {
        let key = endpoint.key();
        let deadline = Instant::now() + self.config.max_wait;
        let mut doomed = Vec::new();

        let mut state = self.state.lock();
        let reused = loop {
            if state.closed {
                drop(state);
                close_all(doomed);
                return Err(Error::PoolClosed);
            }

            let now = Instant::now();
            match state.limit_reached(key, &self.config) {
                None => break self.take_reusable(&mut state, key, now, &mut doomed),
                Some(limit) if now >= deadline => {
                    state.stats.num_rejected += 1;
                    drop(state);
                    close_all(doomed);
                    debug!(addr = %endpoint.addr, limit, "Pool limit reached, rejecting");
                    return Err(Error::MaxActiveExceeded { limit });
                }
                Some(_) => {
                    self.released.wait_until(&mut state, deadline);
                }
            }
        };

        state.reserve(key);
        if let Some(slot) = reused {
            let conn = state.entries[slot].conn.clone();
            drop(state);
            close_all(doomed);
            debug!(conn_id = conn.id(), addr = %endpoint.addr, "Reusing pooled connection");
            return Ok(PooledConnection::new(Arc::clone(self), slot, conn));
        }
        drop(state);
        close_all(doomed);

        let conn = match self.open_connection(endpoint) {
            Ok(conn) => conn,
            Err(e) => {
                self.state.lock().unreserve(key);
                self.released.notify_one();
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        if state.closed {
            state.unreserve(key);
            drop(state);
            conn.close_immediately();
            return Err(Error::PoolClosed);
        }
        let now = Instant::now();
        let slot = state.entries.insert(Entry {
            conn: conn.clone(),
            key,
            created: now,
            returned: now,
        });
        state.stats.num_created += 1;
        drop(state);

        debug!(conn_id = conn.id(), addr = %endpoint.addr, "Created pooled connection");
        Ok(PooledConnection::new(Arc::clone(self), slot, conn))
    }

    fn take_reusable(
        &self,
        state: &mut State,
        key: EndpointKey,
        now: Instant,
        doomed: &mut Vec<Connection>,
    ) -> Option<usize> {
        while let Some(slot) = state.take_idle(key) {
            match expiry(&state.entries[slot], &self.config, now, true) {
                None => return Some(slot),
                Some(reason) => doomed.push(state.retire(slot, reason)),
            }
        }
        None
    }

    fn open_connection(&self, endpoint: &Endpoint) -> Result<Connection> {
        let mut trial = 1;
        loop {
            match self.try_connect(endpoint) {
                Ok(conn) => return Ok(conn),
                Err(e) if trial < CONNECT_TRIALS => {
                    debug!(addr = %endpoint.addr, trial, error = %e, "Connect attempt failed");
                    thread::sleep(CONNECT_RETRY_DELAY);
                    trial += 1;
                }
                Err(e) => {
                    warn!(addr = %endpoint.addr, trials = trial, error = %e, "Failed to open pooled connection");
                    return Err(e);
                }
            }
        }
    }

    fn try_connect(&self, endpoint: &Endpoint) -> Result<Connection> {
        let timeout = self.config.connect_timeout;
        let conn = self.dispatchers.connect_timeout(
            endpoint.addr,
            timeout,
            &pooled_handler,
            endpoint.tls.as_ref(),
        )?;
        if let Err(e) = conn.wait_connected(timeout) {
            conn.close_immediately();
            return Err(e);
        }
        Ok(conn)
    }

    fn give_back(&self, slot: usize, destroy: bool) {
        let now = Instant::now();
        let doomed = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get(slot) else {
                return;
            };
            let key = entry.key;

            let reason = if destroy {
                Some(Retire::Destroyed)
            } else if state.closed {
                Some(Retire::Shutdown)
            } else if let Some(reason) = expiry(entry, &self.config, now, false) {
                Some(reason)
            } else if self.config.max_idle.is_some_and(|max| state.num_idle >= max) {
                Some(Retire::IdleLimit)
            } else {
                None
            };

            state.unreserve(key);
            let doomed = match reason {
                Some(reason) => Some(state.retire(slot, reason)),
                None => {
                    state.entries[slot].returned = now;
                    state.push_idle(key, slot);
                    None
                }
            };
            self.released.notify_all();
            doomed
        };

        if let Some(conn) = doomed {
            debug!(conn_id = conn.id(), "Closing returned connection");
            conn.close_immediately();
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let doomed: Vec<Connection> = {
            let mut state = self.state.lock();
            let State { entries, idle, .. } = &mut *state;

            let mut expired = Vec::new();
            for slots in idle.values_mut() {
                slots.retain(|&slot| match expiry(&entries[slot], &self.config, now, false) {
                    Some(reason) => {
                        expired.push((slot, reason));
                        false
                    }
                    None => true,
                });
            }
            idle.retain(|_, slots| !slots.is_empty());

            state.num_idle -= expired.len();
            expired
                .into_iter()
                .map(|(slot, reason)| state.retire(slot, reason))
                .collect()
        };

        if !doomed.is_empty() {
            debug!(retired = doomed.len(), "Pool sweep");
            close_all(doomed);
        }
    }

    /// Stop handing out connections and close the idle ones. Borrowed
    /// connections are closed when they come back.
    fn close(&self) {
        let doomed: Vec<Connection> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let slots: Vec<usize> = state.idle.drain().flat_map(|(_, slots)| slots).collect();
            state.num_idle = 0;
            slots
                .into_iter()
                .map(|slot| state.retire(slot, Retire::Shutdown))
                .collect()
        };
        self.released.notify_all();
        close_all(doomed);
        self.stop_sweeper();
        info!("Connection pool closed");
    }

    fn stop_sweeper(&self) {
        let Some(sweeper) = self.sweeper.lock().take() else {
            return;
        };
        let Sweeper { _stop: stop, thread } = sweeper;
        drop(stop);
        if thread.thread().id() != thread::current().id() {
            let _ = thread.join();
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            num_active: state.active,
            num_idle: state.num_idle,
            ..state.stats.clone()
        }
    }
}

/// Pool of reusable outbound connections.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(dispatchers: Arc<DispatcherPool>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                dispatchers,
                config,
                state: Mutex::new(State::default()),
                released: Condvar::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a connection to `endpoint`, reusing an idle one when possible.
    ///
    /// When the active limits are reached this waits up to `max_wait` for a
    /// release before failing with `MaxActiveExceeded`. New connections
    /// are ready for traffic (handshaken, for secure endpoints) on return.
    pub fn acquire(&self, endpoint: &Endpoint) -> Result<PooledConnection> {
        self.inner.acquire(endpoint)
    }

    /// Return a connection to the pool.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close a borrowed connection instead of returning it.
    pub fn destroy(&self, mut conn: PooledConnection) {
        conn.finish(true);
    }

    /// Retire idle connections that are closed or past the pool's idle
    /// and lifetime limits.
    pub fn sweep(&self) {
        self.inner.sweep();
    }

    /// Run `sweep` periodically on a background thread until the pool is
    /// closed or dropped.
    pub fn start_sweeper(&self) -> io::Result<()> {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }

        let (stop, stopped) = bounded::<()>(1);
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        let thread = thread::Builder::new()
            .name("pool-sweeper".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match pool.upgrade() {
                        Some(pool) => pool.sweep(),
                        None => break,
                    },
                    _ => break,
                }
            })?;

        *sweeper = Some(Sweeper { _stop: stop, thread });
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn is_open(&self) -> bool {
        !self.inner.state.lock().closed
    }

    /// Close idle connections and refuse further acquires. Borrowed
    /// connections stay usable and are closed when released.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Close every connection the pool manages, borrowed ones included.
    pub fn destroy_all(&self) {
        self.inner.close();
        let active: Vec<Connection> = {
            let state = self.inner.state.lock();
            state.entries.iter().map(|(_, e)| e.conn.clone()).collect()
        };
        close_all(active);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// A borrowed connection. Dereferences to `Connection`; goes back to the
/// pool when dropped, which is allowed from inside the connection's own
/// callbacks.
pub struct PooledConnection {
    conn: Connection,
    slot: usize,
    pool: Arc<PoolInner>,
    returned: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, slot: usize, conn: Connection) -> Self {
        Self {
            conn,
            slot,
            pool,
            returned: false,
        }
    }

    fn finish(&mut self, destroy: bool) {
        if self.returned {
            return;
        }
        self.returned = true;
        if !destroy {
            // Drop whatever handler the borrower installed.
            self.conn.reset_handler(Box::new(NoopHandler));
        }
        self.pool.give_back(self.slot, destroy);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("slot", &self.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::connection::engine::testing::{client_config, server_config};
    use crate::connection::{Handler, TlsServer};
    use std::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    struct Echo;

    impl Handler for Echo {
        fn on_data(&mut self, conn: &Connection) -> Result<()> {
            let data = conn.read_available();
            conn.write(data)?;
            Ok(())
        }
    }

    fn echo_server(dispatchers: &Arc<DispatcherPool>, tls: Option<TlsServer>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dispatchers = Arc::clone(dispatchers);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                if dispatchers
                    .accept(stream, &|_: &Connection| Echo, tls.as_ref())
                    .is_err()
                {
                    break;
                }
            }
        });
        addr
    }

    fn setup(config: PoolConfig) -> (ConnectionPool, Endpoint) {
        let dispatchers =
            Arc::new(DispatcherPool::with_dispatchers(2, DispatcherConfig::default()).unwrap());
        let addr = echo_server(&dispatchers, None);
        (ConnectionPool::new(dispatchers, config), Endpoint::new(addr))
    }

    fn roundtrip(conn: &Connection, msg: &str) -> String {
        conn.write_str(msg).unwrap();
        let echoed = conn.read_bytes_by_length_timeout(msg.len(), WAIT).unwrap();
        String::from_utf8(echoed.to_vec()).unwrap()
    }

    #[test]
    fn test_release_then_acquire_reuses_connection() {
        let (pool, endpoint) = setup(PoolConfig::default());

        let first = pool.acquire(&endpoint).unwrap();
        assert_eq!(roundtrip(&first, "ping"), "ping");
        let conn = (*first).clone();
        pool.release(first);
        assert_eq!(pool.stats().num_idle, 1);

        let second = pool.acquire(&endpoint).unwrap();
        assert_eq!(*second, conn);
        assert_eq!(roundtrip(&second, "again"), "again");

        let stats = pool.stats();
        assert_eq!(stats.num_created, 1);
        assert_eq!(stats.num_active, 1);
        assert_eq!(stats.num_idle, 0);
    }

    #[test]
    fn test_borrowed_connections_are_distinct() {
        let (pool, endpoint) = setup(PoolConfig::default());

        let a = pool.acquire(&endpoint).unwrap();
        let b = pool.acquire(&endpoint).unwrap();
        assert_ne!(*a, *b);
        assert_eq!(pool.stats().num_active, 2);

        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.num_active, 0);
        assert_eq!(stats.num_idle, 2);
    }

    #[test]
    fn test_sweep_retires_idle_connections() {
        let config = PoolConfig {
            max_idle_time: Some(Duration::from_millis(50)),
            ..PoolConfig::default()
        };
        let (pool, endpoint) = setup(config);

        let conn = pool.acquire(&endpoint).unwrap();
        let raw = (*conn).clone();
        pool.release(conn);
        thread::sleep(Duration::from_millis(100));
        pool.sweep();

        let stats = pool.stats();
        assert_eq!(stats.num_idle, 0);
        assert_eq!(stats.num_destroyed, 1);
        assert_eq!(stats.num_pool_idle_timeout, 1);
        assert!(!raw.is_open());
    }

    #[test]
    fn test_background_sweeper_runs() {
        let config = PoolConfig {
            max_idle_time: Some(Duration::from_millis(20)),
            sweep_interval: Duration::from_millis(20),
            ..PoolConfig::default()
        };
        let (pool, endpoint) = setup(config);
        pool.start_sweeper().unwrap();

        pool.release(pool.acquire(&endpoint).unwrap());
        let deadline = Instant::now() + WAIT;
        while pool.stats().num_pool_idle_timeout == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.stats().num_pool_idle_timeout, 1);
        pool.close();
    }

    #[test]
    fn test_max_active_rejects_after_wait() {
        let config = PoolConfig {
            max_active: Some(1),
            max_wait: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let (pool, endpoint) = setup(config);

        let held = pool.acquire(&endpoint).unwrap();
        let err = pool.acquire(&endpoint).unwrap_err();
        assert!(matches!(err, Error::MaxActiveExceeded { limit: 1 }));
        assert_eq!(pool.stats().num_rejected, 1);
        drop(held);
    }

    #[test]
    fn test_waiting_acquire_gets_released_connection() {
        let config = PoolConfig {
            max_active_per_endpoint: Some(1),
            max_wait: WAIT,
            ..PoolConfig::default()
        };
        let (pool, endpoint) = setup(config);

        let held = pool.acquire(&endpoint).unwrap();
        let raw = (*held).clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(held);
        });

        let next = pool.acquire(&endpoint).unwrap();
        assert_eq!(*next, raw);
        releaser.join().unwrap();
    }

    #[test]
    fn test_release_of_closed_connection_is_destroyed() {
        let (pool, endpoint) = setup(PoolConfig::default());

        let conn = pool.acquire(&endpoint).unwrap();
        conn.close_immediately();
        pool.release(conn);

        let stats = pool.stats();
        assert_eq!(stats.num_destroyed, 1);
        assert_eq!(stats.num_idle, 0);
        assert_eq!(stats.num_active, 0);
    }

    #[test]
    fn test_idle_limit_destroys_surplus() {
        let config = PoolConfig {
            max_idle: Some(1),
            ..PoolConfig::default()
        };
        let (pool, endpoint) = setup(config);

        let a = pool.acquire(&endpoint).unwrap();
        let b = pool.acquire(&endpoint).unwrap();
        pool.release(a);
        pool.release(b);

        let stats = pool.stats();
        assert_eq!(stats.num_idle, 1);
        assert_eq!(stats.num_destroyed, 1);
    }

    #[test]
    fn test_destroy_closes_connection() {
        let (pool, endpoint) = setup(PoolConfig::default());

        let conn = pool.acquire(&endpoint).unwrap();
        let raw = (*conn).clone();
        pool.destroy(conn);

        assert!(!raw.is_open());
        assert_eq!(pool.stats().num_destroyed, 1);
        assert_ne!(*pool.acquire(&endpoint).unwrap(), raw);
    }

    #[test]
    fn test_close_and_destroy_all() {
        let (pool, endpoint) = setup(PoolConfig::default());

        let borrowed = pool.acquire(&endpoint).unwrap();
        pool.release(pool.acquire(&endpoint).unwrap());

        pool.close();
        assert!(!pool.is_open());
        assert_eq!(pool.stats().num_idle, 0);
        assert!(borrowed.is_open());
        assert!(matches!(pool.acquire(&endpoint), Err(Error::PoolClosed)));

        pool.destroy_all();
        assert!(!borrowed.is_open());
        drop(borrowed);
        assert_eq!(pool.stats().num_active, 0);
    }

    #[test]
    fn test_unreachable_endpoint_fails_after_retries() {
        let (pool, _) = setup(PoolConfig::default());
        let dead = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let err = pool.acquire(&Endpoint::new(dead)).unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
        let stats = pool.stats();
        assert_eq!(stats.num_created, 0);
        assert_eq!(stats.num_active, 0);
    }

    #[test]
    fn test_secure_endpoints_use_separate_buckets() {
        let dispatchers =
            Arc::new(DispatcherPool::with_dispatchers(2, DispatcherConfig::default()).unwrap());
        let addr = echo_server(&dispatchers, Some(TlsServer::new(server_config())));
        let pool = ConnectionPool::new(dispatchers, PoolConfig::default());

        let tls = TlsClient::new(client_config(), "localhost").unwrap();
        let secure = Endpoint::secure(addr, tls);
        let conn = pool.acquire(&secure).unwrap();
        assert!(conn.is_handshake_complete());
        assert_eq!(roundtrip(&conn, "sealed"), "sealed");
        pool.release(conn);

        // Same address, but a plain endpoint must not get the TLS connection.
        assert_eq!(pool.stats().num_idle, 1);
        let plain = pool.acquire(&Endpoint::new(addr)).unwrap();
        assert!(!plain.is_secure());
        assert_eq!(pool.stats().num_idle, 1);
        pool.destroy(plain);
    }

    /// Gives its pooled connection back from inside `on_data`.
    struct ReleaseOnData {
        borrowed: Arc<Mutex<Option<PooledConnection>>>,
    }

    impl Handler for ReleaseOnData {
        fn on_data(&mut self, conn: &Connection) -> Result<()> {
            conn.read_available();
            let borrowed = self.borrowed.lock().take();
            drop(borrowed);
            Ok(())
        }
    }

    #[test]
    fn test_release_from_own_callback() {
        let (pool, endpoint) = setup(PoolConfig::default());

        let borrowed = pool.acquire(&endpoint).unwrap();
        let conn = (*borrowed).clone();
        let slot = Arc::new(Mutex::new(None));
        conn.set_handler(Box::new(ReleaseOnData {
            borrowed: Arc::clone(&slot),
        }));
        *slot.lock() = Some(borrowed);
        conn.write_str("bye").unwrap();

        let deadline = Instant::now() + WAIT;
        while pool.stats().num_idle != 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.stats().num_idle, 1);

        let again = pool.acquire(&endpoint).unwrap();
        assert_eq!(*again, conn);
        assert_eq!(roundtrip(&again, "still here"), "still here");
    }
}
