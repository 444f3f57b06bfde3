// src/connection/mod.rs

//! Per-connection state: the socket wrapper, the request lifecycle, the entry
//! tying them to a decoder, and the registry of live entries.

mod entry;
mod registry;
mod request;
mod stream;

pub use entry::ConnectionEntry;
pub use registry::ConnectionRegistry;
pub use request::{CloseCallback, CloseReason, Request, RequestState};
pub(crate) use request::Transition;
pub use stream::{AnyStream, SharedStream};

use mio::Token;
use std::fmt;

/// Opaque, unique handle of a live connection. Doubles as its readiness token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) usize);

impl ConnectionId {
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a connection as reported to loggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
}

impl ConnectionInfo {
    pub(crate) fn new(id: ConnectionId, peer: String) -> Self {
        Self { id, peer }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.peer)
    }
}
