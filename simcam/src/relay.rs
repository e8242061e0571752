//! TCP relay: streams frames from a device to one network client.
//!
//! ```text
//!   bind ──► wait for client ──► take frame ──► write_all ──┐
//!                                    ▲                       │
//!                                    └── until budget ◄──────┘
//! ```
//!
//! The relay serves exactly one client and sends at most `frame_budget`
//! frames. Every frame goes out whole: partial writes are continued from the
//! unsent remainder once the socket reports writable again. All blocking
//! points wake at least every `poll_interval` to check the shutdown flag.
//!
//! A shutdown that arrives mid-frame lets the frame finish, so the client
//! only ever sees whole frames. If the client does not drain it within
//! [`SHUTDOWN_GRACE`], the frame is abandoned and the stream ends short.
//!
//! The listener and the client connection are closed when [`Relay::run`]
//! returns, on every path.

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use minstant::Instant;
use mio::{Events, Interest, Poll, Token};

use crate::config::RelayConfig;
use crate::consumer::{ReadError, ReadMode, ReadOutcome, Reader};
use crate::net::{Endpoint, StreamListener, StreamSocket};
use crate::trace::{debug, info, trace, warn};

const LISTENER: Token = Token(0);
const CLIENT: Token = Token(1);

/// How long a frame in flight may take to finish once shutdown is requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    /// The client went away or the connection broke mid-stream.
    #[error("connection to {peer} lost after {frames} frames: {source}")]
    Connection {
        peer: Endpoint,
        frames: u64,
        #[source]
        source: io::Error,
    },
    #[error("reading from device failed: {0}")]
    Read(#[from] ReadError),
}

/// Why a relay session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// All `frame_budget` frames were sent.
    BudgetReached,
    /// The device shut down first.
    DeviceClosed,
    /// The shutdown flag was raised.
    Shutdown,
}

/// Summary of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    /// The client served, if one connected.
    pub peer: Option<Endpoint>,
    /// Frames written completely.
    pub frames: u64,
    /// Bytes written.
    pub bytes: u64,
    /// Writes that accepted only part of what was offered.
    pub short_writes: u64,
    /// A frame was cut off because the client stalled past [`SHUTDOWN_GRACE`].
    pub truncated: bool,
    pub end: RelayEnd,
}

impl RelayReport {
    fn new() -> Self {
        Self {
            peer: None,
            frames: 0,
            bytes: 0,
            short_writes: 0,
            truncated: false,
            end: RelayEnd::Shutdown,
        }
    }
}

/// A bound, not yet connected relay.
pub struct Relay {
    listener: StreamListener,
    poll: Poll,
    events: Events,
    config: RelayConfig,
}

impl Relay {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// [`RelayError::Bind`] if the address cannot be bound,
    /// [`RelayError::Poll`] if the poller cannot be created.
    pub fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let endpoint = config.bind;
        let mut listener = StreamListener::bind(endpoint)
            .map_err(|source| RelayError::Bind { endpoint, source })?;
        let poll = Poll::new().map_err(RelayError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(RelayError::Poll)?;

        info!(
            bind = %endpoint,
            frame_budget = config.frame_budget,
            "relay listening"
        );
        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(8),
            config: config.clone(),
        })
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.listener.local_addr()
    }

    /// Serves one client, then closes everything.
    ///
    /// # Errors
    ///
    /// [`RelayError::Connection`] if the client disconnects or the
    /// connection fails mid-stream; other variants on local I/O failure.
    pub fn run(
        mut self,
        reader: &Reader<'_>,
        shutdown: &AtomicBool,
    ) -> Result<RelayReport, RelayError> {
        let mut report = RelayReport::new();

        let Some((mut conn, peer)) = self.accept(shutdown)? else {
            info!("relay stopped before a client connected");
            return Ok(report);
        };
        report.peer = Some(peer);
        info!(%peer, "client connected");

        // One client only.
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "failed to deregister listener");
        }
        if let Err(e) = conn.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        if let Some(size) = self.config.send_buffer_size {
            if let Err(e) = conn.set_send_buffer_size(size) {
                warn!(size, error = %e, "failed to set send buffer size");
            }
        }
        self.poll
            .registry()
            .register(&mut conn, CLIENT, Interest::WRITABLE)
            .map_err(RelayError::Poll)?;

        let wait = ReadMode::blocking_for(self.config.poll_interval());
        report.end = RelayEnd::BudgetReached;
        while report.frames < self.config.frame_budget {
            if shutdown.load(Ordering::Acquire) {
                report.end = RelayEnd::Shutdown;
                break;
            }

            let frame = match reader.take(wait) {
                Ok(ReadOutcome::Frame(frame)) => frame,
                Ok(ReadOutcome::EndOfStream) => {
                    info!("device closed, ending relay");
                    report.end = RelayEnd::DeviceClosed;
                    break;
                }
                Err(ReadError::TimedOut | ReadError::Interrupted) => continue,
                Err(e) => return Err(e.into()),
            };

            let seq = frame.seq();
            let sent = self.write_all(&conn, frame.as_bytes(), shutdown, &mut report);
            drop(frame);

            match sent {
                Ok(true) => {
                    report.frames += 1;
                    debug!(seq, sent = report.frames, "frame relayed");
                }
                Ok(false) => {
                    warn!(%peer, seq, "client stalled during shutdown, frame cut short");
                    report.truncated = true;
                    report.end = RelayEnd::Shutdown;
                    break;
                }
                Err(source) => {
                    warn!(%peer, frames = report.frames, error = %source, "client connection lost");
                    return Err(RelayError::Connection {
                        peer,
                        frames: report.frames,
                        source,
                    });
                }
            }
        }

        if let Err(e) = conn.shutdown_write() {
            debug!(error = %e, "failed to half-close client connection");
        }
        info!(
            %peer,
            frames = report.frames,
            bytes = report.bytes,
            short_writes = report.short_writes,
            end = ?report.end,
            "relay finished"
        );
        Ok(report)
    }

    /// Waits for the first client. `Ok(None)` once `shutdown` is raised.
    fn accept(
        &mut self,
        shutdown: &AtomicBool,
    ) -> Result<Option<(StreamSocket, Endpoint)>, RelayError> {
        loop {
            if let Some(pair) = self.listener.try_accept().map_err(RelayError::Accept)? {
                return Ok(Some(pair));
            }
            if shutdown.load(Ordering::Acquire) {
                return Ok(None);
            }
            self.wait_ready().map_err(RelayError::Poll)?;
        }
    }

    /// Writes all of `data`, continuing after short writes.
    ///
    /// Returns `Ok(false)` if the frame could not be finished within
    /// [`SHUTDOWN_GRACE`] of `shutdown` being raised.
    fn write_all(
        &mut self,
        conn: &StreamSocket,
        mut data: &[u8],
        shutdown: &AtomicBool,
        report: &mut RelayReport,
    ) -> io::Result<bool> {
        let mut give_up: Option<Instant> = None;
        while !data.is_empty() {
            match conn.try_write(data)? {
                Some(0) => return Err(ErrorKind::WriteZero.into()),
                Some(n) => {
                    if n < data.len() {
                        report.short_writes += 1;
                        trace!(sent = n, remaining = data.len() - n, "short write");
                    }
                    report.bytes += n as u64;
                    data = &data[n..];
                }
                None => {
                    if give_up.is_none() && shutdown.load(Ordering::Acquire) {
                        debug!(remaining = data.len(), "shutdown requested, finishing frame");
                        give_up = Some(Instant::now() + SHUTDOWN_GRACE);
                    }
                    if give_up.is_some_and(|at| Instant::now() >= at) {
                        return Ok(false);
                    }
                    self.wait_ready()?;
                }
            }
        }
        Ok(true)
    }

    /// One bounded poll. Readiness is re-checked by the caller, so which
    /// token fired does not matter.
    fn wait_ready(&mut self) -> io::Result<()> {
        let interval = self.config.poll_interval();
        match self.poll.poll(&mut self.events, Some(interval)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("local", &self.local_endpoint().ok())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
