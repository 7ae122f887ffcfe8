//! Error types for the I/O engine.
//!
//! `InsufficientData` is a control-flow signal rather than a failure: the
//! caller should retry once more bytes have arrived. Every other variant
//! ends (at most) the connection it was raised on.

use std::io;
use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not enough buffered bytes to satisfy the read. Retry after more data arrives.
    #[error("insufficient data")]
    InsufficientData,

    /// A bounded read would need more than `max` bytes of buffering.
    #[error("max read size of {max} bytes exceeded")]
    MaxReadSizeExceeded { max: usize },

    /// The connection (or its dispatcher) has already been closed.
    #[error("connection is closed")]
    Closed,

    /// The dispatcher no longer accepts registrations.
    #[error("dispatcher {0} is closed")]
    DispatcherClosed(usize),

    /// Handshake or record-layer failure reported by the TLS engine.
    #[error("tls error: {0}")]
    Tls(String),

    /// The wrap scratch buffer hit its growth ceiling.
    #[error("tls record buffer exceeded {0} bytes")]
    TlsBufferLimit(usize),

    #[error("connection pool is closed")]
    PoolClosed,

    /// Pool limits reached and no connection was released within the wait time.
    #[error("max active connections ({limit}) exceeded")]
    MaxActiveExceeded { limit: usize },

    /// An outbound connect failed after all trials.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid utf-8 in received data")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the "retry after more data" signal.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Error::InsufficientData)
    }

    /// True if this error should close the connection it was raised on.
    pub fn is_fatal(&self) -> bool {
        !self.is_insufficient_data()
    }

    pub(crate) fn tls(err: impl std::fmt::Display) -> Self {
        Error::Tls(err.to_string())
    }
}
