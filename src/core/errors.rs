// src/core/errors.rs

//! Defines the primary error type for the connection core.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// The error type handed to the core by a failing record handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, FcgiError>;

/// The main error enum, representing all possible failures within the server core.
#[derive(Error, Debug)]
pub enum FcgiError {
    #[error("IO Error: {0}")]
    Io(Arc<io::Error>),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Unsupported FastCGI protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Handler fault: {0}")]
    Handler(String),

    #[error("Connection is already closed")]
    ConnectionClosed,

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// `std::io::Error` is not cloneable, so it is shared behind an `Arc`.
impl Clone for FcgiError {
    fn clone(&self) -> Self {
        match self {
            FcgiError::Io(e) => FcgiError::Io(Arc::clone(e)),
            FcgiError::InvalidState(s) => FcgiError::InvalidState(s.clone()),
            FcgiError::Protocol(s) => FcgiError::Protocol(s.clone()),
            FcgiError::UnsupportedVersion(v) => FcgiError::UnsupportedVersion(*v),
            FcgiError::Handler(s) => FcgiError::Handler(s.clone()),
            FcgiError::ConnectionClosed => FcgiError::ConnectionClosed,
            FcgiError::Internal(s) => FcgiError::Internal(s.clone()),
        }
    }
}

impl PartialEq for FcgiError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FcgiError::Io(e1), FcgiError::Io(e2)) => e1.kind() == e2.kind(),
            (FcgiError::InvalidState(s1), FcgiError::InvalidState(s2)) => s1 == s2,
            (FcgiError::Protocol(s1), FcgiError::Protocol(s2)) => s1 == s2,
            (FcgiError::UnsupportedVersion(v1), FcgiError::UnsupportedVersion(v2)) => v1 == v2,
            (FcgiError::Handler(s1), FcgiError::Handler(s2)) => s1 == s2,
            (FcgiError::Internal(s1), FcgiError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl FcgiError {
    /// Returns the underlying I/O error kind, if this is an I/O failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            FcgiError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// True for errors raised by the decoder for malformed input.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FcgiError::Protocol(_) | FcgiError::UnsupportedVersion(_)
        )
    }
}

impl From<io::Error> for FcgiError {
    fn from(e: io::Error) -> Self {
        FcgiError::Io(Arc::new(e))
    }
}

impl From<HandlerError> for FcgiError {
    fn from(e: HandlerError) -> Self {
        FcgiError::Handler(e.to_string())
    }
}
