//! Dispatcher-owned table of registered handles.
//!
//! Only the dispatcher thread touches a `HandleRegistry`, so it needs no
//! locking. Tokens are never reused: a stale readiness event for a closed
//! handle finds nothing instead of reaching a newer connection.

use mio::Token;
use std::collections::HashMap;

pub struct HandleRegistry<H> {
    handles: HashMap<Token, H>,
}

impl<H> HandleRegistry<H> {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    /// Insert a handle. Returns the previous one if the token was taken.
    pub fn insert(&mut self, token: Token, handle: H) -> Option<H> {
        self.handles.insert(token, handle)
    }

    pub fn get(&self, token: Token) -> Option<&H> {
        self.handles.get(&token)
    }

    pub fn remove(&mut self, token: Token) -> Option<H> {
        self.handles.remove(&token)
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Iterate over all handles.
    pub fn iter(&self) -> impl Iterator<Item = (Token, &H)> {
        self.handles.iter().map(|(t, h)| (*t, h))
    }

    /// Remove and return every handle.
    pub fn drain(&mut self) -> Vec<(Token, H)> {
        self.handles.drain().collect()
    }
}

impl<H> Default for HandleRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
