// src/connection/request.rs

//! Defines the per-connection `Request`: the lifecycle of the (single) FastCGI
//! request carried by a connection, its closure hooks, and the response side.

use super::ConnectionInfo;
use super::stream::SharedStream;
use crate::core::protocol::record::parse_name_value_pairs;
use crate::core::protocol::{
    BeginRequestBody, EndRequestBody, ProtocolStatus, Record, RecordCodec, RecordKind, Role,
};
use crate::core::{FcgiError, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio_util::codec::Encoder;
use tracing::{debug, warn};

/// Lifecycle of a request. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    NotBegun,
    Active,
    Closing,
    Closed,
}

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The application completed the request.
    Normal,
    /// Peer reset, protocol violation, handler fault or server shutdown.
    Abrupt,
}

/// A closure hook. Invoked exactly once, when the request reaches `Closed`.
pub type CloseCallback = Box<dyn FnOnce(&Request, CloseReason) + Send>;

/// Result of asking a request to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Another caller closed the request first; nothing was done.
    AlreadyClosed,
    /// This call closed the request. `hooked` is true when the connection's own
    /// closure hook (installed at BeginRequest) ran and reported the closure.
    Closed { hooked: bool },
}

struct RequestInner {
    state: RequestState,
    close_reason: Option<CloseReason>,
    request_id: u16,
    begin: Option<BeginRequestBody>,
    core_hook_installed: bool,
    callbacks: Vec<CloseCallback>,
    params_buf: BytesMut,
    params: HashMap<String, String>,
    params_complete: bool,
    body: BytesMut,
    stdin_complete: bool,
}

/// The logical request state of one connection.
pub struct Request {
    conn: ConnectionInfo,
    stream: Arc<SharedStream>,
    inner: Mutex<RequestInner>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Request")
            .field("conn", &self.conn)
            .field("state", &inner.state)
            .field("request_id", &inner.request_id)
            .field("role", &inner.begin.map(|b| b.role))
            .finish()
    }
}

impl Request {
    pub(crate) fn new(conn: ConnectionInfo, stream: Arc<SharedStream>) -> Self {
        Self {
            conn,
            stream,
            inner: Mutex::new(RequestInner {
                state: RequestState::NotBegun,
                close_reason: None,
                request_id: 0,
                begin: None,
                core_hook_installed: false,
                callbacks: Vec::new(),
                params_buf: BytesMut::new(),
                params: HashMap::new(),
                params_complete: false,
                body: BytesMut::new(),
                stdin_complete: false,
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.conn
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    pub fn is_begun(&self) -> bool {
        self.inner.lock().begin.is_some()
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.inner.lock().state,
            RequestState::Closing | RequestState::Closed
        )
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason
    }

    /// The FastCGI request id, or 0 before BeginRequest.
    pub fn request_id(&self) -> u16 {
        self.inner.lock().request_id
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.lock().begin.map(|b| b.role)
    }

    /// True when the web server asked to reuse the connection. The connection
    /// is still closed after the request ends.
    pub fn keep_conn(&self) -> bool {
        self.inner.lock().begin.is_some_and(|b| b.keep_conn())
    }

    pub fn param(&self, name: &str) -> Option<String> {
        self.inner.lock().params.get(name).cloned()
    }

    pub fn params(&self) -> HashMap<String, String> {
        self.inner.lock().params.clone()
    }

    pub fn params_complete(&self) -> bool {
        self.inner.lock().params_complete
    }

    /// STDIN received so far.
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().body)
    }

    pub fn stdin_complete(&self) -> bool {
        self.inner.lock().stdin_complete
    }

    /// Registers a closure hook. Hooks run in registration order. A hook added
    /// after the request closed runs immediately with the recorded reason.
    pub fn add_close_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Request, CloseReason) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        match (inner.state, inner.close_reason) {
            (RequestState::Closed, Some(reason)) => {
                drop(inner);
                run_callback(self, Box::new(callback), reason);
            }
            _ => inner.callbacks.push(Box::new(callback)),
        }
    }

    /// Attaches a BeginRequest and installs the connection's own closure hook
    /// in the same step. Fails for a second BeginRequest on one connection.
    pub(crate) fn begin(
        &self,
        request_id: u16,
        body: BeginRequestBody,
        core_hook: CloseCallback,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != RequestState::NotBegun {
            return Err(FcgiError::Protocol(format!(
                "BEGIN_REQUEST {request_id} on a connection already carrying request {}",
                inner.request_id
            )));
        }
        inner.state = RequestState::Active;
        inner.request_id = request_id;
        inner.begin = Some(body);
        inner.core_hook_installed = true;
        inner.callbacks.insert(0, core_hook);
        Ok(())
    }

    /// True if `request_id` names the request currently in flight.
    pub(crate) fn is_active_for(&self, request_id: u16) -> bool {
        let inner = self.inner.lock();
        inner.state == RequestState::Active && inner.request_id == request_id
    }

    /// Folds a PARAMS record into the parameter map. The empty record that
    /// ends the stream triggers parsing, since pairs may span records.
    /// A stream longer than `limit` bytes is a protocol violation.
    pub(crate) fn append_params(&self, content: &[u8], limit: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if !content.is_empty() {
            if inner.params_buf.len() + content.len() > limit {
                return Err(FcgiError::Protocol(format!(
                    "PARAMS stream exceeds {limit} bytes"
                )));
            }
            inner.params_buf.extend_from_slice(content);
            return Ok(());
        }
        let raw = std::mem::take(&mut inner.params_buf);
        for (name, value) in parse_name_value_pairs(&raw)? {
            inner.params.insert(
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
        inner.params_complete = true;
        Ok(())
    }

    /// Appends STDIN content to the body. A body longer than `limit` bytes
    /// is a protocol violation.
    pub(crate) fn append_stdin(&self, content: &[u8], limit: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if content.is_empty() {
            inner.stdin_complete = true;
            return Ok(());
        }
        if inner.body.len() + content.len() > limit {
            return Err(FcgiError::Protocol(format!(
                "request body exceeds {limit} bytes"
            )));
        }
        inner.body.extend_from_slice(content);
        Ok(())
    }

    fn write_record(&self, kind: RecordKind, content: Bytes) -> Result<()> {
        let request_id = {
            let inner = self.inner.lock();
            match inner.state {
                RequestState::Active => inner.request_id,
                RequestState::NotBegun => {
                    return Err(FcgiError::InvalidState(
                        "cannot respond before BEGIN_REQUEST".into(),
                    ));
                }
                RequestState::Closing | RequestState::Closed => {
                    return Err(FcgiError::ConnectionClosed);
                }
            }
        };
        let mut buf = BytesMut::new();
        RecordCodec.encode(Record::new(kind, request_id, content), &mut buf)?;
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Sends response bytes on the STDOUT stream.
    pub fn write_stdout(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.write_record(RecordKind::Stdout, Bytes::copy_from_slice(data))
    }

    /// Sends diagnostic bytes on the STDERR stream.
    pub fn write_stderr(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.write_record(RecordKind::Stderr, Bytes::copy_from_slice(data))
    }

    /// Completes the request: terminates STDOUT, sends END_REQUEST and closes
    /// the connection normally. A failed write closes it abruptly instead.
    pub fn end(&self, app_status: u32) -> Result<()> {
        let body = EndRequestBody {
            app_status,
            protocol_status: ProtocolStatus::RequestComplete,
        };
        let written = self
            .write_record(RecordKind::Stdout, Bytes::new())
            .and_then(|_| self.write_record(RecordKind::EndRequest, body.to_bytes()));
        match written {
            Ok(()) => self.close(),
            Err(e) => {
                if !matches!(e, FcgiError::ConnectionClosed) {
                    warn!(
                        "Failed to complete request on connection {}: {}",
                        self.conn, e
                    );
                    self.close_with(CloseReason::Abrupt);
                }
                Err(e)
            }
        }
    }

    /// Closes the connection through the normal-completion path.
    pub fn close(&self) -> Result<()> {
        if !self.is_begun() {
            return Err(FcgiError::InvalidState(
                "cannot complete a request that never began".into(),
            ));
        }
        match self.close_with(CloseReason::Normal) {
            Transition::Closed { .. } => Ok(()),
            Transition::AlreadyClosed => Err(FcgiError::ConnectionClosed),
        }
    }

    /// Moves the request to `Closed` exactly once: shuts the socket down, then
    /// runs every registered hook with `reason`.
    pub(crate) fn close_with(&self, reason: CloseReason) -> Transition {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, RequestState::Closing | RequestState::Closed) {
                return Transition::AlreadyClosed;
            }
            inner.state = RequestState::Closing;
        }

        if let Err(e) = self.stream.shutdown() {
            // Peer may have gone already; the descriptor is released on drop anyway.
            debug!("Shutdown of connection {} reported: {}", self.conn, e);
        }

        let (callbacks, hooked) = {
            let mut inner = self.inner.lock();
            inner.state = RequestState::Closed;
            inner.close_reason = Some(reason);
            (
                std::mem::take(&mut inner.callbacks),
                inner.core_hook_installed,
            )
        };
        for callback in callbacks {
            run_callback(self, callback, reason);
        }
        Transition::Closed { hooked }
    }
}

fn run_callback(request: &Request, callback: CloseCallback, reason: CloseReason) {
    if catch_unwind(AssertUnwindSafe(|| callback(request, reason))).is_err() {
        warn!(
            "A close callback panicked for connection {}",
            request.connection()
        );
    }
}
