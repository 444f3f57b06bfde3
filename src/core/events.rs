// src/core/events.rs

//! Defines the event dispatcher: one ordered list of subscribers per record
//! kind, invoked synchronously on the reactor thread.

use crate::connection::Request;
use crate::core::protocol::{Record, RecordKind};
use crate::core::{FcgiError, HandlerError};
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A subscriber. Handlers run inline on the reactor thread and must return
/// promptly; a blocking handler stalls every connection. Work that takes
/// longer keeps a clone of the `Arc<Request>` and completes it from another
/// thread with `end` or `close`.
pub type RecordHandler =
    Arc<dyn Fn(&Arc<Request>, &Record) -> Result<(), HandlerError> + Send + Sync>;

/// The record kinds applications can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeginRequest,
    Params,
    Stdin,
    Stdout,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::BeginRequest,
        EventKind::Params,
        EventKind::Stdin,
        EventKind::Stdout,
    ];

    pub fn for_record(kind: RecordKind) -> Option<Self> {
        match kind {
            RecordKind::BeginRequest => Some(EventKind::BeginRequest),
            RecordKind::Params => Some(EventKind::Params),
            RecordKind::Stdin => Some(EventKind::Stdin),
            RecordKind::Stdout => Some(EventKind::Stdout),
            _ => None,
        }
    }

    fn slot(self) -> usize {
        match self {
            EventKind::BeginRequest => 0,
            EventKind::Params => 1,
            EventKind::Stdin => 2,
            EventKind::Stdout => 3,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventDispatcher {
    slots: [RwLock<Vec<(SubscriptionId, RecordHandler)>>; 4],
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in EventKind::ALL {
            map.entry(&kind, &self.handler_count(kind));
        }
        map.finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subscriber to `kind`'s slot.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Arc<Request>, &Record) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots[kind.slot()].write().push((id, Arc::new(handler)));
        id
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        for slot in &self.slots {
            let mut handlers = slot.write();
            if let Some(pos) = handlers.iter().position(|(sid, _)| *sid == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn on_begin_request<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Arc<Request>, &Record) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(EventKind::BeginRequest, handler)
    }

    pub fn on_params<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Arc<Request>, &Record) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Params, handler)
    }

    pub fn on_stdin<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Arc<Request>, &Record) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Stdin, handler)
    }

    pub fn on_stdout<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Arc<Request>, &Record) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Stdout, handler)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.slots[kind.slot()].read().len()
    }

    /// Invokes every subscriber of `kind` in registration order. The first
    /// error or panic stops the remaining subscribers and is returned.
    pub(crate) fn dispatch(
        &self,
        kind: EventKind,
        request: &Arc<Request>,
        record: &Record,
    ) -> Result<(), FcgiError> {
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<RecordHandler> = self.slots[kind.slot()]
            .read()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(request, record))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(FcgiError::from(e)),
                Err(panic) => return Err(FcgiError::Handler(panic_message(panic.as_ref()))),
            }
        }
        Ok(())
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}
