// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use fcgi_reactor::config::ServerOptions;
use fcgi_reactor::connection::{ConnectionInfo, Request};
use fcgi_reactor::core::protocol::record::put_name_value_pair;
use fcgi_reactor::core::protocol::{
    BeginRequestBody, Record, RecordCodec, RecordDecoder, RecordKind, Role,
};
use fcgi_reactor::core::{FcgiError, ServerLogger};
use fcgi_reactor::{FcgiServer, ListenerInfo};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(5);

/// One observed logger call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Received {
        conn: usize,
    },
    ClosedAbruptly {
        conn: usize,
        request_id: Option<u16>,
    },
    ClosedNormally {
        conn: usize,
        request_id: u16,
    },
    InvalidRecord {
        conn: usize,
        kind: RecordKind,
    },
    ServerError(String),
    SocketError(String),
    Started,
    Stopped,
    Shutdown,
}

/// A `ServerLogger` that remembers every call.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    events: Mutex<Vec<LogEvent>>,
    panic_on_invalid_record: AtomicBool,
}

impl RecordingLogger {
    /// Makes every later `invalid_record` call panic after it is recorded,
    /// injecting a fault the reactor itself has to catch.
    pub fn panic_on_invalid_records(&self) {
        self.panic_on_invalid_record.store(true, Ordering::SeqCst);
    }

    pub fn server_errors_containing(&self, needle: &str) -> usize {
        self.count(|e| matches!(e, LogEvent::ServerError(msg) if msg.contains(needle)))
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&LogEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn abrupt_closures(&self) -> Vec<(usize, Option<u16>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LogEvent::ClosedAbruptly { conn, request_id } => Some((*conn, *request_id)),
                _ => None,
            })
            .collect()
    }

    pub fn normal_closures(&self) -> usize {
        self.count(|e| matches!(e, LogEvent::ClosedNormally { .. }))
    }

    pub fn wait_for(&self, pred: impl Fn(&LogEvent) -> bool) -> bool {
        wait_until(|| self.count(&pred) > 0)
    }

    fn push(&self, event: LogEvent) {
        self.events.lock().push(event);
    }
}

impl ServerLogger for RecordingLogger {
    fn connection_received(&self, conn: &ConnectionInfo) {
        self.push(LogEvent::Received {
            conn: conn.id.as_usize(),
        });
    }

    fn connection_closed_abruptly(&self, conn: &ConnectionInfo, request: Option<&Request>) {
        self.push(LogEvent::ClosedAbruptly {
            conn: conn.id.as_usize(),
            request_id: request.map(|r| r.request_id()),
        });
    }

    fn connection_closed_normally(&self, conn: &ConnectionInfo, request: &Request) {
        self.push(LogEvent::ClosedNormally {
            conn: conn.id.as_usize(),
            request_id: request.request_id(),
        });
    }

    fn invalid_record(&self, conn: &ConnectionInfo, record: &Record) {
        self.push(LogEvent::InvalidRecord {
            conn: conn.id.as_usize(),
            kind: record.kind,
        });
        if self.panic_on_invalid_record.load(Ordering::SeqCst) {
            panic!("logger failed on {record}");
        }
    }

    fn server_error(&self, error: &FcgiError, description: &str) {
        self.push(LogEvent::ServerError(format!("{description}: {error}")));
    }

    fn socket_error(&self, listener: &ListenerInfo, error: &FcgiError, description: &str) {
        self.push(LogEvent::SocketError(format!(
            "{description} on {listener}: {error}"
        )));
    }

    fn server_started(&self) {
        self.push(LogEvent::Started);
    }

    fn server_stopped(&self) {
        self.push(LogEvent::Stopped);
    }

    fn shutdown(&self) {
        self.push(LogEvent::Shutdown);
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// Polls `cond` until it holds or `WAIT` elapses.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A server bound to an ephemeral loopback port with a recording logger.
pub struct TestServer {
    pub server: FcgiServer,
    pub logger: Arc<RecordingLogger>,
    pub addr: SocketAddr,
}

impl TestServer {
    /// Creates and binds a server without starting it, so handlers can be
    /// registered first.
    pub fn bound() -> Self {
        Self::bound_with(ServerOptions::default())
    }

    pub fn bound_with(options: ServerOptions) -> Self {
        init_tracing();
        let logger = Arc::new(RecordingLogger::default());
        let server = FcgiServer::with_logger(options, logger.clone()).unwrap();
        let addr = server.bind("127.0.0.1:0").unwrap();
        Self {
            server,
            logger,
            addr,
        }
    }

    /// Binds and starts the reactor in the background.
    pub fn started() -> Self {
        let ctx = Self::bound();
        ctx.server.start(true).unwrap();
        ctx
    }

    pub fn start(&self) {
        self.server.start(true).unwrap();
    }

    pub fn connect(&self) -> FcgiClient<TcpStream> {
        FcgiClient::new(TcpStream::connect(self.addr).unwrap())
    }

    pub fn wait_for_connections(&self, n: usize) -> bool {
        wait_until(|| self.server.connection_count() == n)
    }
}

/// A minimal FastCGI client playing the web server's side.
pub struct FcgiClient<S: Read + Write> {
    stream: S,
    decoder: RecordDecoder,
    pending: VecDeque<Record>,
}

impl FcgiClient<TcpStream> {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream.set_nodelay(true).unwrap();
        Self::from_stream(stream)
    }
}

#[cfg(unix)]
impl FcgiClient<std::os::unix::net::UnixStream> {
    pub fn new_unix(stream: std::os::unix::net::UnixStream) -> Self {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        Self::from_stream(stream)
    }
}

impl<S: Read + Write> FcgiClient<S> {
    fn from_stream(stream: S) -> Self {
        Self {
            stream,
            decoder: RecordDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn stream(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Writes all `records` with a single write call.
    pub fn send(&mut self, records: &[Record]) -> io::Result<()> {
        let mut buf = Vec::new();
        for record in records {
            buf.extend(RecordCodec::encode_to_vec(record.clone()).map_err(io::Error::other)?);
        }
        self.send_raw(&buf)
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Reads until the next record is complete. `None` on end of stream.
    pub fn read_record(&mut self) -> Option<Record> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(record);
            }
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => return None,
                Ok(n) => {
                    for record in self.decoder.feed(&buf[..n]) {
                        self.pending.push_back(record.unwrap());
                    }
                }
            }
        }
    }

    /// Reads every record until the server closes the connection.
    pub fn read_until_closed(&mut self) -> Vec<Record> {
        let mut records = Vec::new();
        while let Some(record) = self.read_record() {
            records.push(record);
        }
        records
    }

    /// True once the server has closed its end of the connection.
    pub fn is_closed_by_server(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) => {
                    return matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
                    );
                }
            }
        }
    }
}

pub fn begin(request_id: u16) -> Record {
    let body = BeginRequestBody {
        role: Role::Responder,
        flags: 0,
    };
    Record::new(RecordKind::BeginRequest, request_id, body.to_bytes())
}

pub fn params(request_id: u16, pairs: &[(&str, &str)]) -> Record {
    let mut buf = BytesMut::new();
    for (name, value) in pairs {
        put_name_value_pair(&mut buf, name.as_bytes(), value.as_bytes());
    }
    Record::new(RecordKind::Params, request_id, buf.freeze())
}

pub fn stdin(request_id: u16, data: &[u8]) -> Record {
    Record::new(RecordKind::Stdin, request_id, Bytes::copy_from_slice(data))
}

/// BEGIN_REQUEST, PARAMS with its terminator, and an empty STDIN.
pub fn simple_request(request_id: u16, pairs: &[(&str, &str)]) -> Vec<Record> {
    vec![
        begin(request_id),
        params(request_id, pairs),
        params(request_id, &[]),
        stdin(request_id, b""),
    ]
}
