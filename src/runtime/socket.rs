//! Per-connection socket bound to one dispatcher.
//!
//! Physical reads and writes only ever happen on the owning dispatcher's
//! thread, so the stream mutex is uncontended; it exists so the handle can
//! be shared with application threads that only inspect counters.

use crate::queue::ChunkQueue;
use crate::runtime::buffer::ReadOutcome;
use crate::runtime::dispatcher::DispatcherHandle;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::io::{self, IoSlice, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Maximum number of queued chunks handed to one vectored write.
const MAX_IOVECS: usize = 64;

pub struct SocketHandle {
    stream: Mutex<Option<TcpStream>>,
    fd: RawFd,
    token: Token,
    dispatcher: DispatcherHandle,
    /// Registered with the multiplexer.
    registered: AtomicBool,
    /// Write interest currently registered. Owner thread only.
    writable_interest: AtomicBool,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl SocketHandle {
    /// Bind `stream` to `dispatcher`, allocating a fresh token.
    /// `peer_addr` overrides the stream's own answer for sockets that are
    /// still connecting.
    pub fn new(stream: TcpStream, dispatcher: DispatcherHandle, peer_addr: Option<SocketAddr>) -> Self {
        let fd = stream.as_raw_fd();
        let peer_addr = peer_addr.or_else(|| stream.peer_addr().ok());
        let local_addr = stream.local_addr().ok();
        Self {
            stream: Mutex::new(Some(stream)),
            fd,
            token: dispatcher.next_token(),
            dispatcher,
            registered: AtomicBool::new(false),
            writable_interest: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            peer_addr,
            local_addr,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.stream.lock().is_none()
    }

    fn interest(writable: bool) -> Interest {
        if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Add the socket to the multiplexer. Owner thread only.
    pub fn register(&self, registry: &Registry, writable: bool) -> io::Result<()> {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writable_interest.store(writable, Ordering::Relaxed);
        registry.register(&mut SourceFd(&self.fd), self.token, Self::interest(writable))
    }

    /// Make the registered interest match `writable`. Before registration
    /// only the desired state is recorded. Owner thread only.
    pub fn set_write_interest(&self, registry: &Registry, writable: bool) -> io::Result<()> {
        let previous = self.writable_interest.swap(writable, Ordering::Relaxed);
        if previous == writable || !self.registered.load(Ordering::Acquire) || self.is_closed() {
            return Ok(());
        }
        registry.reregister(&mut SourceFd(&self.fd), self.token, Self::interest(writable))
    }

    /// Remove the socket from the multiplexer. Owner thread only.
    pub fn deregister(&self, registry: &Registry) {
        if self.registered.swap(false, Ordering::AcqRel) && !self.is_closed() {
            // Closing the descriptor deregisters it anyway.
            let _ = registry.deregister(&mut SourceFd(&self.fd));
        }
    }

    /// One read through the dispatcher's allocator.
    pub fn read(&self) -> io::Result<ReadOutcome> {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        let outcome = self.dispatcher.with_allocator(|alloc| alloc.read_from(stream))?;
        if let ReadOutcome::Data(ref chunk) = outcome {
            self.bytes_received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            self.dispatcher.record_read(chunk.len());
        }
        Ok(outcome)
    }

    /// Write queued chunks until the queue is empty or the socket would
    /// block. Returns the number of bytes written.
    pub fn write_from(&self, queue: &mut ChunkQueue) -> io::Result<usize> {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        let mut total = 0;
        while !queue.is_empty() {
            let slices: Vec<IoSlice<'_>> = queue
                .iter()
                .take(MAX_IOVECS)
                .map(|chunk| IoSlice::new(chunk))
                .collect();

            match stream.write_vectored(&slices) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    drop(slices);
                    queue.advance(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if total > 0 {
            self.bytes_sent.fetch_add(total as u64, Ordering::Relaxed);
            self.dispatcher.record_write(total);
        }
        Ok(total)
    }

    /// Check whether a non-blocking connect has completed.
    /// `Ok(false)` means the writable event was spurious.
    pub fn finish_connect(&self) -> io::Result<bool> {
        let guard = self.stream.lock();
        let Some(stream) = guard.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Half-close the write side after a graceful drain.
    pub fn shutdown_write(&self) {
        if let Some(stream) = self.stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }

    /// Release the descriptor. Idempotent.
    pub fn close(&self) {
        self.stream.lock().take();
    }
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("token", &self.token)
            .field("fd", &self.fd)
            .field("peer", &self.peer_addr)
            .finish()
    }
}
