//! The device instance: owner of the slot, the notification channel, the
//! buffer pool and (for frame-producing devices) the producer thread.
//!
//! # Lifecycle
//!
//! ```text
//! open()                                   shutdown() / drop
//! ──────                                   ─────────────────
//! 1. allocate frame buffers (pool)         1. stop + join producer
//! 2. slot + notification channel           2. close slot, recycle pending frame
//! 3. spawn producer thread                 3. wake all readers (end-of-stream)
//!                                          4. release buffers
//! ```
//!
//! Each resource acquired in `open` is owned by a local binding, so an error
//! at step *n* drops steps *n-1..1* in reverse order on the way out.
//!
//! Readers borrow the device ([`Device::reader`]), so the compiler rejects any
//! reader that would outlive it.

use std::collections::TryReserveError;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::consumer::{CancelToken, Reader};
use crate::frame::{Frame, FrameGeometry, PatternKind};
use crate::pool::{self, BufferPool};
use crate::producer::{FireHandler, FireOutcome, FrameProducer};
use crate::slot::SharedFrameSlot;
use crate::sync::NotificationChannel;
use crate::trace::{debug, error, info};

/// Default number of frame buffers in circulation: one being drawn by the
/// producer, one sitting in the slot, one held by a reader.
pub const DEFAULT_FRAME_BUFFERS: usize = 3;

/// Default capacity of a [`DeviceKind::SimpleBuffer`] device.
pub const DEFAULT_SIMPLE_CAPACITY: usize = 1024;

/// Default producer period.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(2000);

/// Which kind of device to build. Fixed for the lifetime of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Writers deposit up to `capacity` bytes; each write becomes one frame.
    SimpleBuffer { capacity: usize },
    /// A timer synthesizes a frame every `period`. With `period: None` no
    /// thread is started and frames are produced by [`Device::fire_now`].
    FrameProducing {
        geometry: FrameGeometry,
        pattern: PatternKind,
        period: Option<Duration>,
    },
}

impl DeviceKind {
    /// The 640×480 RAW12 camera firing every two seconds.
    #[must_use]
    pub fn camera() -> Self {
        Self::FrameProducing {
            geometry: FrameGeometry::VGA_RAW12,
            pattern: PatternKind::Gradient,
            period: Some(DEFAULT_PERIOD),
        }
    }

    /// Largest payload a reader can receive from this device.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        match self {
            Self::SimpleBuffer { capacity } => *capacity,
            Self::FrameProducing { geometry, .. } => geometry.frame_size(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Frame buffers could not be allocated during setup.
    #[error("failed to allocate {bytes} bytes of frame buffers")]
    ResourceExhausted {
        bytes: usize,
        #[source]
        source: TryReserveError,
    },
    /// The producer thread could not be started.
    #[error("failed to spawn producer thread: {0}")]
    Spawn(#[source] io::Error),
    /// The configuration cannot describe a working device.
    #[error("invalid device configuration: {0}")]
    InvalidConfig(&'static str),
    /// `write` on a device whose frames come from the producer.
    #[error("device does not accept writes")]
    NotWritable,
    /// `fire_now` on a device without a producer.
    #[error("device has no frame producer")]
    NotProducing,
    /// The device has begun shutting down.
    #[error("device is shut down")]
    Closed,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Frames published into the slot (producer ticks and writes).
    pub frames_produced: u64,
    /// Producer ticks that failed and were skipped.
    pub generation_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) frames_produced: AtomicU64,
    pub(crate) generation_failures: AtomicU64,
}

/// State shared between the device, its producer thread and its readers.
#[derive(Debug)]
pub(crate) struct Core {
    pub(crate) slot: SharedFrameSlot,
    pub(crate) notify: Arc<NotificationChannel>,
    pub(crate) pool: Option<Arc<BufferPool>>,
    pub(crate) counters: Counters,
    pub(crate) frame_size: usize,
    next_seq: AtomicU64,
}

impl Core {
    /// Allocates the next frame sequence number. Sequence numbers start at 1.
    #[inline]
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Publishes a frame and wakes readers. Usable from the fire handler.
    ///
    /// A displaced frame is dropped here, which returns its buffer to the
    /// pool.
    pub(crate) fn publish(&self, frame: Frame) -> Result<(), DeviceError> {
        let displaced = self.slot.publish(frame).map_err(|_| DeviceError::Closed)?;
        drop(displaced);
        self.counters.frames_produced.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_all();
        Ok(())
    }
}

/// A simulated device instance.
///
/// Owns every resource the pipeline needs; pass `&Device` (or a
/// [`Reader`] borrowed from it) to whoever needs to consume frames.
pub struct Device {
    kind: DeviceKind,
    core: Arc<Core>,
    producer: Mutex<Option<FrameProducer>>,
    fire: Option<FireHandler>,
    closing: AtomicBool,
}

impl Device {
    /// Builds a device with the default number of frame buffers.
    ///
    /// # Errors
    ///
    /// See [`Device::open_with_buffers`].
    pub fn open(kind: DeviceKind) -> Result<Self, DeviceError> {
        Self::open_with_buffers(kind, DEFAULT_FRAME_BUFFERS)
    }

    /// Builds a device with `buffers` frame buffers in circulation.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::InvalidConfig`] for a zero frame size, zero period,
    ///   or fewer than two buffers.
    /// - [`DeviceError::ResourceExhausted`] if the buffers cannot be allocated.
    /// - [`DeviceError::Spawn`] if the producer thread cannot be started.
    pub fn open_with_buffers(kind: DeviceKind, buffers: usize) -> Result<Self, DeviceError> {
        let frame_size = kind.frame_size();
        if frame_size == 0 {
            return Err(DeviceError::InvalidConfig("frame size must be non-zero"));
        }

        info!(?kind, frame_size, "opening device");

        let pool = match &kind {
            DeviceKind::SimpleBuffer { .. } => None,
            DeviceKind::FrameProducing { period, .. } => {
                if period.is_some_and(|p| p.is_zero()) {
                    return Err(DeviceError::InvalidConfig("producer period must be non-zero"));
                }
                if buffers < 2 {
                    return Err(DeviceError::InvalidConfig(
                        "at least two frame buffers are required",
                    ));
                }
                // Twice the buffers in circulation: a push can then only wait
                // on a pop that is still in progress.
                let capacity = buffers.saturating_mul(2);
                let pool = BufferPool::with_buffers(capacity, frame_size, buffers).map_err(
                    |source| DeviceError::ResourceExhausted {
                        bytes: frame_size.saturating_mul(buffers),
                        source,
                    },
                )?;
                debug!(buffers, frame_size, "frame buffers allocated");
                Some(Arc::new(pool))
            }
        };

        let core = Arc::new(Core {
            slot: SharedFrameSlot::new(),
            notify: Arc::new(NotificationChannel::new()),
            pool,
            counters: Counters::default(),
            frame_size,
            next_seq: AtomicU64::new(1),
        });

        let (producer, fire) = match &kind {
            DeviceKind::SimpleBuffer { .. } => (None, None),
            DeviceKind::FrameProducing {
                geometry,
                pattern,
                period,
            } => {
                let handler = FireHandler::new(Arc::clone(&core), *geometry, *pattern);
                match period {
                    Some(period) => {
                        let producer = FrameProducer::spawn(handler.clone(), *period)
                            .map_err(|e| {
                                error!(error = %e, "failed to spawn producer thread");
                                DeviceError::Spawn(e)
                            })?;
                        (Some(producer), Some(handler))
                    }
                    None => (None, Some(handler)),
                }
            }
        };

        info!("device ready");
        Ok(Self {
            kind,
            core,
            producer: Mutex::new(producer),
            fire,
            closing: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// Size of every frame this device produces (capacity for simple buffers).
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.core.frame_size
    }

    /// A new consumer handle with its own cancellation token.
    #[must_use]
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.core, CancelToken::new(Arc::clone(&self.core.notify)))
    }

    /// Deposits `data` as one frame (simple-buffer devices only).
    ///
    /// At most `capacity` bytes are kept; the number kept is returned. An
    /// empty write publishes nothing.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotWritable`] on a frame-producing device,
    /// [`DeviceError::Closed`] after shutdown began,
    /// [`DeviceError::ResourceExhausted`] if the frame cannot be allocated.
    pub fn write(&self, data: &[u8]) -> Result<usize, DeviceError> {
        let DeviceKind::SimpleBuffer { capacity } = self.kind else {
            return Err(DeviceError::NotWritable);
        };
        if self.core.slot.is_closed() {
            return Err(DeviceError::Closed);
        }
        let n = data.len().min(capacity);
        if n == 0 {
            return Ok(0);
        }

        let mut buf = pool::alloc_zeroed(n)
            .map_err(|source| DeviceError::ResourceExhausted { bytes: n, source })?;
        buf.copy_from_slice(&data[..n]);

        let seq = self.core.next_seq();
        self.core.publish(Frame::new(seq, buf))?;
        debug!(seq, bytes = n, "write published");
        Ok(n)
    }

    /// Runs the producer's fire handler once on the calling thread.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotProducing`] on a simple-buffer device,
    /// [`DeviceError::Closed`] after shutdown began.
    pub fn fire_now(&self) -> Result<FireOutcome, DeviceError> {
        let fire = self.fire.as_ref().ok_or(DeviceError::NotProducing)?;
        if self.core.slot.is_closed() {
            return Err(DeviceError::Closed);
        }
        fire.fire()
    }

    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            frames_produced: self.core.counters.frames_produced.load(Ordering::Relaxed),
            generation_failures: self.core.counters.generation_failures.load(Ordering::Relaxed),
        }
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.slot.is_closed()
    }

    /// Begins shutdown: stops the producer, then releases every blocked
    /// reader with end-of-stream. Idempotent.
    ///
    /// Takes `&self` so a thread can close the device while others are
    /// blocked in [`Reader`] calls borrowed from it.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("device shutting down");

        // The producer must be gone before anything it touches is released.
        let producer = self
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut producer) = producer {
            producer.stop();
        }

        if let Some(pending) = self.core.slot.close() {
            debug!(seq = pending.seq(), "discarding unread frame");
        }
        self.core.notify.notify_all();

        let stats = self.stats();
        info!(
            frames_produced = stats.frames_produced,
            generation_failures = stats.generation_failures,
            "device removed"
        );
    }

    /// Closes the device and releases its resources.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("slot", &self.core.slot)
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .finish()
    }
}
