//! Reader-facing interface of a device.
//!
//! A [`Reader`] borrows its [`Device`](crate::Device) and offers three ways to
//! get at frames:
//!
//! - [`Reader::read`] copies the next frame into a caller buffer, blocking or
//!   not depending on [`ReadMode`].
//! - [`Reader::take`] hands over the frame itself; its buffer goes back to
//!   the device when the frame is dropped.
//! - [`Reader::poll`] reports readiness without consuming anything, and
//!   [`Reader::register_waker`] attaches a `mio::Waker` for event loops.
//!
//! Every reader owns a [`CancelToken`]. Cancelling it makes a blocked call
//! return [`ReadError::Interrupted`] without touching the slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::device::Core;
use crate::frame::Frame;
use crate::sync::{NotificationChannel, WaitResult, WakerId, WakerSlotsFull};
use crate::trace::trace;

/// How a read behaves when no frame is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Suspend until a frame is published, the device shuts down, the reader
    /// is cancelled or `timeout` elapses.
    Blocking { timeout: Option<Duration> },
    /// Fail with [`ReadError::WouldBlock`].
    NonBlocking,
}

impl ReadMode {
    /// Block with no timeout.
    pub const BLOCKING: Self = Self::Blocking { timeout: None };

    #[must_use]
    pub const fn blocking_for(timeout: Duration) -> Self {
        Self::Blocking {
            timeout: Some(timeout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// Non-blocking read with no frame ready.
    #[error("no frame ready")]
    WouldBlock,
    /// The wait was cancelled or cut short by a signal. Retry if desired.
    #[error("read interrupted")]
    Interrupted,
    /// A blocking read with a timeout saw no frame in time.
    #[error("timed out waiting for a frame")]
    TimedOut,
    /// The destination buffer cannot hold any data.
    #[error("destination buffer is empty")]
    Fault,
}

/// Result of a successful [`Reader::take`].
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The device is shutting down and no frame is left.
    EndOfStream,
}

/// Readiness bits reported by [`Reader::poll`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PollEvents(u8);

impl PollEvents {
    pub const EMPTY: Self = Self(0);
    /// A frame is ready to read.
    pub const READABLE: Self = Self(1);
    /// Always reported: the device never applies write back-pressure.
    pub const WRITABLE: Self = Self(1 << 1);
    /// The device is shutting down.
    pub const HANGUP: Self = Self(1 << 2);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[must_use]
    pub const fn is_hangup(self) -> bool {
        self.contains(Self::HANGUP)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PollEvents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PollEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Interrupts a reader's blocking call from another thread.
///
/// Cancellation is one-shot: the call it interrupts clears it, so the next
/// call blocks normally again.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<NotificationChannel>,
}

impl CancelToken {
    pub(crate) fn new(notify: Arc<NotificationChannel>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    /// Interrupts the current (or next) blocking call on the owning reader.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        // Other sleepers see a spurious wake and go back to sleep.
        self.notify.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clears a pending cancellation without consuming it in a read.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    fn consume(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// Keeps an external waker attached; detaches it on drop.
#[derive(Debug)]
#[must_use = "the waker is detached when the guard is dropped"]
pub struct WakerGuard<'d> {
    notify: &'d NotificationChannel,
    id: WakerId,
}

impl WakerGuard<'_> {
    #[must_use]
    pub fn id(&self) -> WakerId {
        self.id
    }
}

impl Drop for WakerGuard<'_> {
    fn drop(&mut self) {
        self.notify.deregister(self.id);
    }
}

/// A consumer of one device. Any number may exist at once.
#[derive(Debug)]
pub struct Reader<'d> {
    core: &'d Core,
    cancel: CancelToken,
}

impl<'d> Reader<'d> {
    pub(crate) fn new(core: &'d Core, cancel: CancelToken) -> Self {
        Self { core, cancel }
    }

    /// Token that interrupts this reader's blocking calls.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Size of the frames this device produces.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.core.frame_size
    }

    /// Copies the next frame into `buf`.
    ///
    /// Returns the number of bytes copied, at most `buf.len()`; the rest of
    /// the frame is discarded. `Ok(0)` means end-of-stream and is only
    /// returned to blocking calls.
    ///
    /// # Errors
    ///
    /// [`ReadError::Fault`] if `buf` is empty, otherwise as for
    /// [`take`](Self::take).
    pub fn read(&self, buf: &mut [u8], mode: ReadMode) -> Result<usize, ReadError> {
        if buf.is_empty() {
            return Err(ReadError::Fault);
        }
        match self.take(mode)? {
            ReadOutcome::Frame(frame) => {
                let n = frame.copy_to(buf);
                trace!(seq = frame.seq(), bytes = n, "frame read");
                Ok(n)
            }
            ReadOutcome::EndOfStream => Ok(0),
        }
    }

    /// Takes ownership of the next frame.
    ///
    /// Each published frame goes to exactly one caller. When several readers
    /// are woken by one publish, the losers go back to waiting.
    ///
    /// # Errors
    ///
    /// - [`ReadError::WouldBlock`]: non-blocking and nothing ready, even
    ///   after shutdown.
    /// - [`ReadError::Interrupted`]: cancelled, or a signal hit the wait.
    /// - [`ReadError::TimedOut`]: the blocking timeout elapsed.
    pub fn take(&self, mode: ReadMode) -> Result<ReadOutcome, ReadError> {
        let deadline = match mode {
            ReadMode::Blocking {
                timeout: Some(timeout),
            } => Some(Instant::now() + timeout),
            _ => None,
        };

        loop {
            // Epoch first: a publish after this point is seen by `wait`.
            let epoch = self.core.notify.epoch();
            if let Some(frame) = self.core.slot.try_take() {
                return Ok(ReadOutcome::Frame(frame));
            }
            // Non-blocking callers learn about shutdown from `poll`.
            if mode == ReadMode::NonBlocking {
                return Err(ReadError::WouldBlock);
            }
            if self.core.slot.is_closed() {
                return Ok(ReadOutcome::EndOfStream);
            }
            if self.cancel.consume() {
                return Err(ReadError::Interrupted);
            }

            match self.core.notify.wait(epoch, deadline) {
                WaitResult::Woken => {}
                WaitResult::Interrupted => return Err(ReadError::Interrupted),
                WaitResult::TimedOut => {
                    return self
                        .core
                        .slot
                        .try_take()
                        .map(ReadOutcome::Frame)
                        .ok_or(ReadError::TimedOut);
                }
            }
        }
    }

    /// Reports readiness for the events in `interest`.
    ///
    /// Never consumes a frame and never blocks. [`PollEvents::HANGUP`] is
    /// reported whenever the device is shutting down, requested or not.
    #[must_use]
    pub fn poll(&self, interest: PollEvents) -> PollEvents {
        let mut events = PollEvents::EMPTY;
        if interest.is_readable() && self.core.slot.peek_ready() {
            events |= PollEvents::READABLE;
        }
        if interest.is_writable() {
            events |= PollEvents::WRITABLE;
        }
        if self.core.slot.is_closed() {
            events |= PollEvents::HANGUP;
        }
        events
    }

    /// Attaches `waker` so it fires on every publish and on shutdown.
    ///
    /// # Errors
    ///
    /// [`WakerSlotsFull`] if the device already has the maximum number of
    /// wakers attached.
    pub fn register_waker(
        &self,
        waker: Arc<mio::Waker>,
    ) -> Result<WakerGuard<'d>, WakerSlotsFull> {
        let notify: &'d NotificationChannel = &self.core.notify;
        let id = notify.register(waker)?;
        Ok(WakerGuard { notify, id })
    }
}
