// src/connection/entry.rs

//! Defines `ConnectionEntry`, which binds one accepted socket to its decoder
//! and its request.

use super::request::Request;
use super::stream::{AnyStream, SharedStream};
use super::{ConnectionId, ConnectionInfo};
use crate::core::protocol::RecordDecoder;
use mio::Registry;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// One tracked connection. Created at accept time and removed from the
/// registry exactly once, when the connection closes.
#[derive(Debug)]
pub struct ConnectionEntry {
    info: ConnectionInfo,
    stream: Arc<SharedStream>,
    /// Only the reactor thread feeds the decoder.
    decoder: Mutex<RecordDecoder>,
    request: Arc<Request>,
    /// Consecutive reads that returned zero bytes.
    zero_reads: AtomicU32,
}

impl ConnectionEntry {
    pub fn new(id: ConnectionId, socket: AnyStream, write_timeout: Duration) -> Self {
        let peer = socket.peer_description();
        let info = ConnectionInfo::new(id, peer);
        let stream = Arc::new(SharedStream::new(socket, write_timeout));
        let request = Arc::new(Request::new(info.clone(), stream.clone()));
        Self {
            info,
            stream,
            decoder: Mutex::new(RecordDecoder::new()),
            request,
            zero_reads: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub(crate) fn stream(&self) -> &SharedStream {
        &self.stream
    }

    pub(crate) fn decoder(&self) -> &Mutex<RecordDecoder> {
        &self.decoder
    }

    pub(crate) fn register(&self, registry: &Registry) -> io::Result<()> {
        self.stream.register(registry, self.info.id.token())
    }

    pub(crate) fn rearm(&self, registry: &Registry) -> io::Result<()> {
        self.stream.rearm(registry, self.info.id.token())
    }

    /// Records a zero-length read and returns how many happened in a row.
    pub(crate) fn note_zero_read(&self) -> u32 {
        self.zero_reads.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn note_data_read(&self) {
        self.zero_reads.store(0, Ordering::Relaxed);
    }
}
