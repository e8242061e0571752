//! TCP listener and stream wrappers for mio-based I/O.
//!
//! Both types are non-blocking; register them with a [`mio::Poll`] and retry
//! on readiness. `try_*` methods fold `WouldBlock` into `Ok(None)`.

use std::io::{self, ErrorKind, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking listening socket.
///
/// Binding sets `SO_REUSEADDR`, so a restarted relay can reuse its port
/// while old connections linger in `TIME_WAIT`.
pub struct StreamListener {
    inner: MioTcpListener,
}

impl StreamListener {
    /// Binds and listens on `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpListener::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Accepts a pending connection, or `Ok(None)` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_accept(&self) -> io::Result<Option<(StreamSocket, Endpoint)>> {
        loop {
            match self.inner.accept() {
                Ok((inner, addr)) => return Ok(Some((StreamSocket { inner }, addr.into()))),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for StreamListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for StreamListener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

/// A connected non-blocking TCP stream.
pub struct StreamSocket {
    inner: MioTcpStream,
}

impl StreamSocket {
    /// Writes as much of `buf` as the kernel accepts right now.
    ///
    /// Returns `Ok(None)` if the send buffer is full. A short count is
    /// normal; callers loop until everything is written.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, including a peer that went away.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<Option<usize>> {
        loop {
            match (&self.inner).write(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Disables Nagle's algorithm.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio doesn't expose buffer sizes
        let fd = self.inner.as_fd();
        rustix::net::sockopt::set_socket_send_buffer_size(fd, size)?;
        Ok(())
    }

    /// Half-closes the stream so the peer sees end-of-file after the data.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is no longer connected.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }
}

impl AsFd for StreamSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for StreamSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
