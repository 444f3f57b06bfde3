// src/connection/stream.rs

//! Wraps the accepted socket types (TCP or local-domain) behind one type that
//! the reactor can read from and requests can write to.

use mio::event::Source;
use mio::net::TcpStream;
#[cfg(unix)]
use mio::net::UnixStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::thread;
use std::time::{Duration, Instant};

/// How long a writer backs off when the socket's send buffer is full.
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// An enum to wrap the different connection socket types into a single type.
#[derive(Debug)]
pub enum AnyStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AnyStream {
    /// Shuts down both halves. The descriptor itself is released on drop.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            AnyStream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            AnyStream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    /// A printable description of the remote end.
    pub fn peer_description(&self) -> String {
        match self {
            AnyStream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            #[cfg(unix)]
            AnyStream::Unix(s) => match s.peer_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => format!("unix:{}", path.display()),
                    None => "unix:unnamed".to_string(),
                },
                Err(_) => "unix:unknown".to_string(),
            },
        }
    }
}

impl Read for AnyStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            AnyStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            AnyStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for AnyStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            AnyStream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            AnyStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            AnyStream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            AnyStream::Unix(s) => s.flush(),
        }
    }
}

impl Source for AnyStream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            AnyStream::Tcp(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            AnyStream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            AnyStream::Tcp(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            AnyStream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            AnyStream::Tcp(s) => s.deregister(registry),
            #[cfg(unix)]
            AnyStream::Unix(s) => s.deregister(registry),
        }
    }
}

/// A connection socket shared between its entry (reads, closure) and its
/// request (response writes).
///
/// The socket lock is only ever held for a single syscall, so a writer stuck
/// on a full send buffer never blocks the reactor's reads.
#[derive(Debug)]
pub struct SharedStream {
    socket: Mutex<AnyStream>,
    write_lock: Mutex<()>,
    write_timeout: Duration,
}

impl SharedStream {
    pub fn new(socket: AnyStream, write_timeout: Duration) -> Self {
        Self {
            socket: Mutex::new(socket),
            write_lock: Mutex::new(()),
            write_timeout,
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.lock().read(buf)
    }

    /// Writes all of `buf`, retrying while the non-blocking socket is full.
    /// Concurrent callers never interleave their buffers.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        let _serialized = self.write_lock.lock();
        let deadline = Instant::now() + self.write_timeout;
        while !buf.is_empty() {
            let result = self.socket.lock().write(buf);
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timed out writing to a congested connection",
                        ));
                    }
                    thread::sleep(WRITE_RETRY_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.socket.lock().shutdown()
    }

    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut *self.socket.lock(), token, Interest::READABLE)
    }

    /// Re-arms the edge-triggered registration so the next readiness wait
    /// reports this socket again if it is still readable.
    pub fn rearm(&self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.reregister(&mut *self.socket.lock(), token, Interest::READABLE)
    }

    pub fn peer_description(&self) -> String {
        self.socket.lock().peer_description()
    }
}
