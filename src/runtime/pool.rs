//! A fixed set of dispatcher threads.
//!
//! New connections are spread round-robin and stay pinned to the
//! dispatcher they were assigned for their whole life.

use crate::config::{Config, DispatcherConfig};
use crate::connection::{Connection, HandlerFactory, TlsClient, TlsServer};
use crate::error::{Error, Result};
use crate::runtime::dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct DispatcherPool {
    dispatchers: Vec<DispatcherHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl DispatcherPool {
    /// Start `config.dispatcher_count()` dispatcher threads.
    pub fn start(config: &Config) -> io::Result<Self> {
        Self::with_dispatchers(config.dispatcher_count(), config.dispatcher.clone())
    }

    pub fn with_dispatchers(count: usize, config: DispatcherConfig) -> io::Result<Self> {
        let count = count.max(1);
        let mut dispatchers = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);

        for id in 0..count {
            let (dispatcher, handle) = Dispatcher::new(id, config.clone())?;
            let thread = thread::Builder::new()
                .name(format!("dispatcher-{id}"))
                .spawn(move || dispatcher.run())?;
            dispatchers.push(handle);
            threads.push(thread);
        }

        info!(dispatchers = count, "Dispatcher pool started");
        Ok(Self {
            dispatchers,
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.dispatchers.len()
    }

    fn next_dispatcher(&self) -> &DispatcherHandle {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.dispatchers[n % self.dispatchers.len()]
    }

    /// Adopt an accepted stream. The connection is registered before it is
    /// returned; for secure connections `on_connect` waits for the handshake.
    pub fn accept(
        &self,
        stream: std::net::TcpStream,
        factory: &dyn HandlerFactory,
        tls: Option<&TlsServer>,
    ) -> Result<Connection> {
        stream.set_nonblocking(true)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let dispatcher = self.next_dispatcher();
        let conn = Connection::accepted(
            mio::net::TcpStream::from_std(stream),
            dispatcher.clone(),
            factory,
            tls,
        )?;
        dispatcher.register(conn.clone())?;
        debug!(conn_id = conn.id(), dispatcher = dispatcher.id(), peer = ?conn.peer_addr(), "Accepted connection");
        Ok(conn)
    }

    /// Start a non-blocking connect. Completion or failure is reported
    /// through the handler; `Connection::wait_connected` blocks for it.
    pub fn connect(
        &self,
        addr: SocketAddr,
        factory: &dyn HandlerFactory,
        tls: Option<&TlsClient>,
    ) -> Result<Connection> {
        let stream = mio::net::TcpStream::connect(addr).map_err(|source| Error::Connect { addr, source })?;
        self.adopt_outbound(stream, addr, factory, tls, false)
    }

    /// Connect synchronously, waiting at most `timeout` for the TCP
    /// handshake. The TLS handshake still runs on the dispatcher.
    pub fn connect_timeout(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        factory: &dyn HandlerFactory,
        tls: Option<&TlsClient>,
    ) -> Result<Connection> {
        let stream = connect_socket(addr, timeout).map_err(|source| Error::Connect { addr, source })?;
        self.adopt_outbound(mio::net::TcpStream::from_std(stream), addr, factory, tls, true)
    }

    fn adopt_outbound(
        &self,
        stream: mio::net::TcpStream,
        addr: SocketAddr,
        factory: &dyn HandlerFactory,
        tls: Option<&TlsClient>,
        connected: bool,
    ) -> Result<Connection> {
        let dispatcher = self.next_dispatcher();
        let conn = Connection::outbound(stream, dispatcher.clone(), addr, factory, tls, connected)?;
        dispatcher.register(conn.clone())?;
        debug!(conn_id = conn.id(), dispatcher = dispatcher.id(), peer = %addr, "Outbound connection");
        Ok(conn)
    }

    pub fn stats(&self) -> Vec<DispatcherStats> {
        self.dispatchers.iter().map(DispatcherHandle::stats).collect()
    }

    /// Close every dispatcher and wait for its thread. Connections get the
    /// configured grace period to drain before they are force-closed.
    pub fn shutdown(&self) {
        for dispatcher in &self.dispatchers {
            dispatcher.close();
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        if threads.is_empty() {
            return;
        }
        for thread in threads {
            if thread.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
        info!("Dispatcher pool stopped");
    }
}

impl Drop for DispatcherPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connect_socket(addr: SocketAddr, timeout: Duration) -> io::Result<std::net::TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.connect_timeout(&addr.into(), timeout)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
