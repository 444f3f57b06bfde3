// src/core/mod.rs

//! Protocol, error, event and observability building blocks shared by the
//! connection and server layers.

pub mod errors;
pub mod events;
pub mod fault;
pub mod logger;
pub mod metrics;
pub mod protocol;

pub use errors::{FcgiError, HandlerError, Result};
pub use events::{EventDispatcher, EventKind, SubscriptionId};
pub use logger::{ServerLogger, TracingLogger};
