// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod server;

// Re-export
pub use crate::config::{Config, ServerOptions};
pub use crate::connection::{CloseReason, ConnectionInfo, Request, RequestState};
pub use crate::core::protocol::{Record, RecordKind};
pub use crate::core::{EventDispatcher, EventKind, FcgiError, ServerLogger, TracingLogger};
pub use crate::server::{FcgiServer, LOCAL_SOCKETS_SUPPORTED, ListenerInfo};
