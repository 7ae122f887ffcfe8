//! Reactor runtime.
//!
//! Each dispatcher owns one mio `Poll` and the sockets registered with it.
//! Sockets never migrate: every physical read and write for a connection
//! happens on the thread of the dispatcher it was assigned to.
//!
//! - `DispatcherPool`: the fixed set of dispatcher threads
//! - `Dispatcher` / `DispatcherHandle`: the loop and its cross-thread handle
//! - `SocketHandle`: per-connection socket, interest bits and byte counters
//! - `ReadAllocator`: per-dispatcher receive buffer

pub(crate) mod buffer;
pub mod dispatcher;
mod pool;
mod registry;
pub(crate) mod socket;

pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats};
pub use pool::DispatcherPool;
