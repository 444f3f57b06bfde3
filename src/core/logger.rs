// src/core/logger.rs

//! The observability interface of the server core.
//!
//! Every method has an empty default body: an implementation only overrides
//! the events it cares about, and a server without a logger simply does not
//! report them.

use crate::connection::{ConnectionInfo, Request};
use crate::core::FcgiError;
use crate::core::protocol::Record;
use crate::server::ListenerInfo;
use tracing::{debug, error, info, warn};

pub trait ServerLogger: Send + Sync {
    /// A connection was accepted and is now tracked.
    fn connection_received(&self, _conn: &ConnectionInfo) {}

    /// A connection closed on the abrupt path. `request` is `None` when it
    /// closed before a BEGIN_REQUEST arrived.
    fn connection_closed_abruptly(&self, _conn: &ConnectionInfo, _request: Option<&Request>) {}

    fn connection_closed_normally(&self, _conn: &ConnectionInfo, _request: &Request) {}

    fn invalid_record(&self, _conn: &ConnectionInfo, _record: &Record) {}

    /// A fault inside the server: a handler failure, or an unclassified fault
    /// caught at the reactor boundary.
    fn server_error(&self, _error: &FcgiError, _description: &str) {}

    /// A fault tied to a listen socket, typically during accept.
    fn socket_error(&self, _listener: &ListenerInfo, _error: &FcgiError, _description: &str) {}

    fn server_started(&self) {}

    fn server_stopped(&self) {}

    /// Releases resources owned by the logger. Called once, on dispose.
    fn shutdown(&self) {}
}

/// Forwards every server event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl ServerLogger for TracingLogger {
    fn connection_received(&self, conn: &ConnectionInfo) {
        debug!("Accepted new connection {} from {}", conn.id, conn.peer);
    }

    fn connection_closed_abruptly(&self, conn: &ConnectionInfo, request: Option<&Request>) {
        match request {
            Some(req) => info!(
                "Connection {} closed abruptly during request {}",
                conn,
                req.request_id()
            ),
            None => info!("Connection {} closed abruptly before any request", conn),
        }
    }

    fn connection_closed_normally(&self, conn: &ConnectionInfo, request: &Request) {
        debug!(
            "Connection {} closed after completing request {}",
            conn,
            request.request_id()
        );
    }

    fn invalid_record(&self, conn: &ConnectionInfo, record: &Record) {
        warn!("Invalid record {} on connection {}", record, conn);
    }

    fn server_error(&self, error: &FcgiError, description: &str) {
        error!("{}: {}", description, error);
    }

    fn socket_error(&self, listener: &ListenerInfo, error: &FcgiError, description: &str) {
        error!("{} on listener {}: {}", description, listener, error);
    }

    fn server_started(&self) {
        info!("FastCGI server started.");
    }

    fn server_stopped(&self) {
        info!("FastCGI server stopped.");
    }
}
