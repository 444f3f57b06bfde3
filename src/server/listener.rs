// src/server/listener.rs

//! Owns the listen sockets: binds them, switches them to listening mode at
//! start, accepts one pending connection per readiness report and releases
//! them on dispose.

use crate::connection::AnyStream;
use crate::core::{FcgiError, Result};
use mio::event::Source;
use mio::net::TcpListener;
#[cfg(unix)]
use mio::net::UnixListener;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// True when this build can bind local-domain (filesystem path) sockets.
pub const LOCAL_SOCKETS_SUPPORTED: bool = cfg!(unix);

/// Identity of a listen socket as reported to loggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerInfo {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for ListenerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerInfo::Tcp(addr) => write!(f, "tcp:{addr}"),
            ListenerInfo::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// An enum to wrap the different listener types into a single type.
#[derive(Debug)]
enum AnyListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl AnyListener {
    fn accept(&self) -> io::Result<AnyStream> {
        match self {
            AnyListener::Tcp(l) => l.accept().map(|(s, _)| AnyStream::Tcp(s)),
            #[cfg(unix)]
            AnyListener::Unix(l) => l.accept().map(|(s, _)| AnyStream::Unix(s)),
        }
    }

    fn source(&mut self) -> &mut dyn Source {
        match self {
            AnyListener::Tcp(l) => l as &mut dyn Source,
            #[cfg(unix)]
            AnyListener::Unix(l) => l as &mut dyn Source,
        }
    }
}

#[derive(Debug)]
enum ListenState {
    Bound(Socket),
    Listening(AnyListener),
    Closed,
}

#[derive(Debug)]
struct ListenSocket {
    token: Token,
    info: ListenerInfo,
    state: ListenState,
}

#[derive(Debug, Default)]
pub struct ListenerManager {
    sockets: Mutex<Vec<ListenSocket>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and binds a TCP listen socket. Returns the bound address, which
    /// differs from `addr` when port 0 was requested.
    pub fn bind_tcp(&self, token: Token, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(addr))?;
        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| FcgiError::Internal("bound TCP socket has no inet address".into()))?;

        self.sockets.lock().push(ListenSocket {
            token,
            info: ListenerInfo::Tcp(local),
            state: ListenState::Bound(socket),
        });
        info!("Bound FastCGI listener on {}", local);
        Ok(local)
    }

    /// Creates and binds a local-domain listen socket at `path`.
    #[cfg(unix)]
    pub fn bind_unix(&self, token: Token, path: PathBuf) -> Result<()> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&SockAddr::unix(&path)?)?;

        info!("Bound FastCGI listener on {}", path.display());
        self.sockets.lock().push(ListenSocket {
            token,
            info: ListenerInfo::Unix(path),
            state: ListenState::Bound(socket),
        });
        Ok(())
    }

    /// True if at least one socket is bound and not yet listening.
    pub fn has_bound(&self) -> bool {
        self.sockets
            .lock()
            .iter()
            .any(|s| matches!(s.state, ListenState::Bound(_)))
    }

    /// Puts every bound socket into listening mode and registers it for
    /// readiness. Returns how many sockets started listening.
    pub fn listen_all(&self, backlog: i32, registry: &Registry) -> Result<usize> {
        let mut sockets = self.sockets.lock();
        let mut started = 0;
        for listen in sockets.iter_mut() {
            if !matches!(listen.state, ListenState::Bound(_)) {
                continue;
            }
            let ListenState::Bound(socket) = std::mem::replace(&mut listen.state, ListenState::Closed)
            else {
                continue;
            };
            socket.listen(backlog)?;
            socket.set_nonblocking(true)?;
            let mut listener = match listen.info {
                ListenerInfo::Tcp(_) => {
                    AnyListener::Tcp(TcpListener::from_std(std::net::TcpListener::from(socket)))
                }
                #[cfg(unix)]
                ListenerInfo::Unix(_) => AnyListener::Unix(UnixListener::from_std(
                    std::os::unix::net::UnixListener::from(socket),
                )),
                #[cfg(not(unix))]
                ListenerInfo::Unix(_) => continue,
            };
            registry.register(listener.source(), listen.token, Interest::READABLE)?;
            debug!("Listening on {} with backlog {}", listen.info, backlog);
            listen.state = ListenState::Listening(listener);
            started += 1;
        }
        Ok(started)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.sockets.lock().iter().any(|s| s.token == token)
    }

    pub fn info(&self, token: Token) -> Option<ListenerInfo> {
        self.sockets
            .lock()
            .iter()
            .find(|s| s.token == token)
            .map(|s| s.info.clone())
    }

    /// Accepts at most one pending connection from the listener behind
    /// `token`, then re-arms it so further pending connections are reported
    /// by the next readiness wait.
    pub fn accept_one(&self, token: Token, registry: &Registry) -> io::Result<Option<AnyStream>> {
        let mut sockets = self.sockets.lock();
        let Some(listen) = sockets.iter_mut().find(|s| s.token == token) else {
            return Ok(None);
        };
        let ListenState::Listening(listener) = &mut listen.state else {
            return Ok(None);
        };
        let accepted = match listener.accept() {
            Ok(stream) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => Err(e),
        };
        registry.reregister(listener.source(), token, Interest::READABLE)?;
        accepted
    }

    /// Closes every listen socket. Closed sockets stay known (so their
    /// addresses can still be reported) until `release`.
    pub fn close_all(&self, registry: &Registry) {
        for listen in self.sockets.lock().iter_mut() {
            if let ListenState::Listening(listener) = &mut listen.state
                && let Err(e) = registry.deregister(listener.source())
            {
                debug!("Deregistering listener {} reported: {}", listen.info, e);
            }
            listen.state = ListenState::Closed;
        }
    }

    /// Forgets every listen socket and removes the filesystem entries of
    /// local-domain sockets.
    pub fn release(&self) {
        for listen in self.sockets.lock().drain(..) {
            if let ListenerInfo::Unix(path) = &listen.info {
                drop(listen.state);
                if let Err(e) = std::fs::remove_file(path)
                    && e.kind() != io::ErrorKind::NotFound
                {
                    warn!("Failed to remove socket file {}: {}", path.display(), e);
                }
            }
        }
    }

    /// TCP addresses of all known listen sockets.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .lock()
            .iter()
            .filter_map(|s| match s.info {
                ListenerInfo::Tcp(addr) => Some(addr),
                ListenerInfo::Unix(_) => None,
            })
            .collect()
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.sockets.lock().iter().map(|s| s.info.clone()).collect()
    }
}
