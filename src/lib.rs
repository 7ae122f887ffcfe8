//! nbio: a non-blocking network I/O engine.
//!
//! - A pool of reactor threads (`DispatcherPool`), each multiplexing many
//!   sockets with mio
//! - Buffered connections with non-blocking, framed reads
//!   (`read_string_by_delimiter`, `read_bytes_by_length`, ...) and queued writes
//! - TLS through a pluggable `HandshakeEngine`, rustls by default
//! - A client-side `ConnectionPool` with idle and lifetime limits
//!
//! Application code implements `Handler` and reacts to `on_connect`,
//! `on_data` and `on_disconnect`, all invoked on the dispatcher thread that
//! owns the connection.

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod queue;
pub mod runtime;
pub mod scanner;

pub use config::{Config, DispatcherConfig, PoolConfig, ReadBufferConfig};
pub use connection::{
    Capabilities, Connection, Handler, HandlerFactory, NoopHandler, TimeoutKind, TlsClient,
    TlsServer,
};
pub use error::{Error, Result};
pub use pool::{ConnectionPool, Endpoint, PoolStats, PooledConnection};
pub use runtime::{DispatcherPool, DispatcherStats};
