// src/server/mod.rs

//! The server: listen sockets, the reactor loop and the start/stop/dispose
//! lifecycle around them.

use crate::config::ServerOptions;
use crate::connection::{
    AnyStream, CloseCallback, CloseReason, ConnectionEntry, ConnectionId, ConnectionInfo,
    ConnectionRegistry, Request, Transition,
};
use crate::core::events::EventDispatcher;
use crate::core::logger::ServerLogger;
use crate::core::{FcgiError, Result, metrics};
use mio::{Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

mod listener;
pub mod metrics_server;
mod pump;
mod reactor;

pub use listener::{LOCAL_SOCKETS_SUPPORTED, ListenerInfo, ListenerManager};

use reactor::Reactor;

/// Token of the waker that interrupts the readiness wait on stop.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// State shared by the server handle, the reactor thread and the closure
/// hooks of live connections.
pub(crate) struct ServerShared {
    pub(crate) options: ServerOptions,
    running: AtomicBool,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) listeners: ListenerManager,
    pub(crate) events: EventDispatcher,
    logger: Option<Arc<dyn ServerLogger>>,
    /// Listener and connection tokens share one counter, so a token is never reused.
    next_token: AtomicUsize,
    pub(crate) poll_registry: Registry,
    waker: Waker,
}

impl ServerShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn logger(&self) -> Option<&dyn ServerLogger> {
        self.logger.as_deref()
    }

    fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Builds the hook installed on a request at BEGIN_REQUEST. It reports the
    /// closure, whichever path closes the request.
    pub(crate) fn closure_hook(self: &Arc<Self>) -> CloseCallback {
        let shared: Weak<ServerShared> = Arc::downgrade(self);
        Box::new(move |request: &Request, reason: CloseReason| {
            if let Some(shared) = shared.upgrade() {
                shared.connection_closed(request.connection(), Some(request), reason);
            }
        })
    }

    /// Drops a closed connection from bookkeeping and reports the closure.
    pub(crate) fn connection_closed(
        &self,
        conn: &ConnectionInfo,
        request: Option<&Request>,
        reason: CloseReason,
    ) {
        self.forget_connection(conn.id);
        match (reason, request) {
            (CloseReason::Normal, Some(request)) => {
                metrics::CONNECTIONS_CLOSED_TOTAL
                    .with_label_values(&["normal"])
                    .inc();
                if let Some(logger) = self.logger() {
                    logger.connection_closed_normally(conn, request);
                }
            }
            (_, request) => {
                metrics::CONNECTIONS_CLOSED_TOTAL
                    .with_label_values(&["abrupt"])
                    .inc();
                if let Some(logger) = self.logger() {
                    logger.connection_closed_abruptly(conn, request);
                }
            }
        }
    }

    /// Idempotent removal from the registry.
    fn forget_connection(&self, id: ConnectionId) {
        if self.connections.remove(id).is_some() {
            metrics::CONNECTED_CLIENTS.dec();
        }
    }

    /// Force-closes a connection on the abrupt path. Safe to call for a
    /// connection that already closed.
    pub(crate) fn close_abruptly(&self, entry: &ConnectionEntry) {
        match entry.request().close_with(CloseReason::Abrupt) {
            // The request's own hook already reported it.
            Transition::Closed { hooked: true } => {}
            Transition::Closed { hooked: false } => {
                self.connection_closed(entry.info(), None, CloseReason::Abrupt)
            }
            Transition::AlreadyClosed => self.forget_connection(entry.id()),
        }
    }

    /// The accept step for a ready listen socket. Failures are reported as
    /// socket errors and never propagate.
    pub(crate) fn accept_from(&self, token: Token) {
        let outcome = match self.listeners.accept_one(token, &self.poll_registry) {
            Ok(Some(socket)) => self.register_connection(socket),
            Ok(None) => Ok(()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = outcome {
            warn!("Failed to accept connection: {}", e);
            if let Some(logger) = self.logger()
                && let Some(listener) = self.listeners.info(token)
            {
                logger.socket_error(&listener, &e, "Failed to accept connection");
            }
        }
    }

    fn register_connection(&self, socket: AnyStream) -> Result<()> {
        if self.connections.len() >= self.options.max_connections {
            warn!(
                "Refusing connection from {}: max_connections ({}) reached.",
                socket.peer_description(),
                self.options.max_connections
            );
            if let Err(e) = socket.shutdown() {
                debug!("Shutdown of refused connection reported: {}", e);
            }
            return Ok(());
        }

        let id = ConnectionId(self.next_token().0);
        let entry = Arc::new(ConnectionEntry::new(
            id,
            socket,
            self.options.write_timeout,
        ));
        if !self.connections.insert(entry.clone()) {
            return Err(FcgiError::Internal(format!(
                "connection id {id} is already tracked"
            )));
        }
        if let Err(e) = entry.register(&self.poll_registry) {
            self.connections.remove(id);
            return Err(e.into());
        }
        metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
        metrics::CONNECTED_CLIENTS.inc();
        debug!("Accepted new connection {}", entry.info());
        if let Some(logger) = self.logger() {
            logger.connection_received(entry.info());
        }

        // Stop may have swept the registry while this connection was being accepted.
        if !self.is_running() {
            self.close_abruptly(&entry);
        }
        Ok(())
    }

    /// Marks the server stopped, closes the listen sockets and abruptly
    /// closes every tracked connection. Idempotent.
    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.listeners.close_all(&self.poll_registry);
        for entry in self.connections.snapshot() {
            self.close_abruptly(&entry);
        }
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake the reactor: {}", e);
        }
        info!("FastCGI server stopped.");
        if let Some(logger) = self.logger() {
            logger.server_stopped();
        }
    }
}

/// A FastCGI server instance. Each instance owns its own reactor, so several
/// independent servers can live in one process.
pub struct FcgiServer {
    shared: Arc<ServerShared>,
    /// The poll instance while no reactor is running.
    poll: Mutex<Option<Poll>>,
    reactor_thread: Mutex<Option<JoinHandle<Poll>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for FcgiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcgiServer")
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .field("listeners", &self.shared.listeners.listeners())
            .finish()
    }
}

impl FcgiServer {
    pub fn new(options: ServerOptions) -> Result<Self> {
        Self::build(options, None)
    }

    pub fn with_logger(options: ServerOptions, logger: Arc<dyn ServerLogger>) -> Result<Self> {
        Self::build(options, Some(logger))
    }

    fn build(options: ServerOptions, logger: Option<Arc<dyn ServerLogger>>) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let poll_registry = poll.registry().try_clone()?;
        let shared = Arc::new(ServerShared {
            options,
            running: AtomicBool::new(false),
            connections: ConnectionRegistry::new(),
            listeners: ListenerManager::new(),
            events: EventDispatcher::new(),
            logger,
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            poll_registry,
            waker,
        });
        Ok(Self {
            shared,
            poll: Mutex::new(Some(poll)),
            reactor_thread: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(FcgiError::InvalidState("server has been disposed".into()));
        }
        Ok(())
    }

    /// Binds a TCP listen socket. Listening starts with the next `start`.
    pub fn bind<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr> {
        self.ensure_usable()?;
        if self.is_running() {
            return Err(FcgiError::InvalidState(
                "cannot bind while the server is running".into(),
            ));
        }
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            FcgiError::InvalidState("address resolved to no socket address".into())
        })?;
        self.shared
            .listeners
            .bind_tcp(self.shared.next_token(), addr)
    }

    /// Binds a local-domain listen socket at `path`.
    #[cfg(unix)]
    pub fn bind_unix<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        self.ensure_usable()?;
        if self.is_running() {
            return Err(FcgiError::InvalidState(
                "cannot bind while the server is running".into(),
            ));
        }
        self.shared
            .listeners
            .bind_unix(self.shared.next_token(), path.as_ref().to_path_buf())
    }

    /// Starts listening on every bound socket and runs the reactor, on this
    /// thread (returning after `stop`) or on a background thread.
    pub fn start(&self, run_in_background: bool) -> Result<()> {
        self.ensure_usable()?;
        if self.is_running() {
            return Err(FcgiError::InvalidState("server is already running".into()));
        }
        if !self.shared.listeners.has_bound() {
            return Err(FcgiError::InvalidState(
                "start requires at least one bound socket".into(),
            ));
        }
        let poll = self.reclaim_poll()?;

        if let Err(e) = self
            .shared
            .listeners
            .listen_all(self.shared.options.listen_backlog, &self.shared.poll_registry)
        {
            self.shared.listeners.close_all(&self.shared.poll_registry);
            *self.poll.lock() = Some(poll);
            return Err(e);
        }
        self.shared.running.store(true, Ordering::SeqCst);
        info!("FastCGI server started.");
        if let Some(logger) = self.shared.logger() {
            logger.server_started();
        }

        let reactor = Reactor::new(poll, self.shared.clone());
        if run_in_background {
            let spawned = thread::Builder::new()
                .name("fcgi-reactor".into())
                .spawn(move || reactor.run());
            match spawned {
                Ok(handle) => *self.reactor_thread.lock() = Some(handle),
                Err(e) => {
                    self.shared.stop();
                    return Err(e.into());
                }
            }
        } else {
            let poll = reactor.run();
            *self.poll.lock() = Some(poll);
        }
        Ok(())
    }

    /// Takes back the poll instance, joining a reactor thread that has
    /// already been told to stop.
    fn reclaim_poll(&self) -> Result<Poll> {
        if let Some(poll) = self.poll.lock().take() {
            return Ok(poll);
        }
        let handle = self.reactor_thread.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| FcgiError::Internal("reactor thread panicked".into())),
            None => Err(FcgiError::InvalidState(
                "the reactor is still in use".into(),
            )),
        }
    }

    /// Stops the server: closes listen sockets and every open connection.
    /// Always succeeds and may be called repeatedly.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Stops the server and releases its listen sockets and the logger's
    /// resources. Idempotent; also runs on drop.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop();
        let handle = self.reactor_thread.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("Reactor thread panicked before dispose.");
        }
        self.shared.listeners.release();
        if let Some(logger) = self.shared.logger() {
            logger.shutdown();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Subscription slots for BEGIN_REQUEST, PARAMS, STDIN and STDOUT records.
    pub fn events(&self) -> &EventDispatcher {
        &self.shared.events
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.shared.listeners.local_addrs()
    }
}

impl Drop for FcgiServer {
    fn drop(&mut self) {
        self.dispose();
    }
}
