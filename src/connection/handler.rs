//! Application callbacks.
//!
//! A `Handler` is created per connection by a `HandlerFactory` and owned by
//! that connection. Which callbacks it wants is declared once through
//! `capabilities()` and cached when the handler is installed, so the
//! dispatcher never asks again per event.
//!
//! Callbacks run on the dispatcher thread and must not block. Long work
//! should move to another thread and come back through `Connection::write`
//! or `Connection::close`, both of which are safe from any thread.

use crate::connection::Connection;
use crate::error::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Callbacks a handler wants to receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const CONNECT = 1 << 0;
        const DATA = 1 << 1;
        const DISCONNECT = 1 << 2;
        const IDLE_TIMEOUT = 1 << 3;
        const CONNECTION_TIMEOUT = 1 << 4;
    }
}

pub trait Handler: Send {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    /// The connection is ready for application traffic. For secure
    /// connections this is after the handshake has finished.
    fn on_connect(&mut self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// New bytes were appended to the receive queue.
    ///
    /// Returning `Error::InsufficientData` just waits for more bytes; any
    /// other error closes the connection with that error as the cause.
    fn on_data(&mut self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Fired exactly once, after the connection has left its dispatcher.
    fn on_disconnect(&mut self, _conn: &Connection, _cause: Option<&Error>) {}

    /// Return true to keep the connection open.
    fn on_idle_timeout(&mut self, _conn: &Connection) -> bool {
        false
    }

    /// Return true to keep the connection open.
    fn on_connection_timeout(&mut self, _conn: &Connection) -> bool {
        false
    }
}

/// Produces a fresh handler for every new connection.
pub trait HandlerFactory: Send + Sync {
    fn new_handler(&self, conn: &Connection) -> Box<dyn Handler>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(&Connection) -> H + Send + Sync,
    H: Handler + 'static,
{
    fn new_handler(&self, conn: &Connection) -> Box<dyn Handler> {
        Box::new(self(conn))
    }
}

/// Handler that wants no callbacks. Used for connections driven purely by
/// the blocking read helpers, such as pooled client connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }
}

/// A handler together with its resolved capabilities.
pub(crate) struct HandlerSlot {
    handler: Box<dyn Handler>,
    capabilities: Capabilities,
}

impl HandlerSlot {
    pub fn new(handler: Box<dyn Handler>) -> Self {
        let capabilities = handler.capabilities();
        Self {
            handler,
            capabilities,
        }
    }

    pub fn has(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn handler(&mut self) -> &mut dyn Handler {
        self.handler.as_mut()
    }

    pub fn replace(&mut self, handler: Box<dyn Handler>) -> Box<dyn Handler> {
        self.capabilities = handler.capabilities();
        std::mem::replace(&mut self.handler, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DataOnly;

    impl Handler for DataOnly {
        fn capabilities(&self) -> Capabilities {
            Capabilities::DATA | Capabilities::DISCONNECT
        }
    }

    #[test]
    fn test_capabilities_resolved_at_install() {
        let mut slot = HandlerSlot::new(Box::new(DataOnly));
        assert!(slot.has(Capabilities::DATA));
        assert!(!slot.has(Capabilities::CONNECT));

        slot.replace(Box::new(NoopHandler));
        assert!(!slot.has(Capabilities::DATA));
        assert!(!slot.has(Capabilities::DISCONNECT));
    }

    #[test]
    fn test_default_capabilities_cover_everything() {
        struct Everything;
        impl Handler for Everything {}

        let slot = HandlerSlot::new(Box::new(Everything));
        assert!(slot.has(Capabilities::all()));
    }
}
