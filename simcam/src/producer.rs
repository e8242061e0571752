//! Timer-driven frame production.
//!
//! The producer is a dedicated thread that sleeps until each deadline and then
//! runs the [`FireHandler`]. The handler is written for a restricted context:
//! it never sleeps, never allocates and only takes the slot's spinlock for a
//! pointer swap.
//!
//! ```text
//!            spawn                     deadline reached
//!   Idle ─────────────► Armed ─────────────────────────► Firing
//!                         ▲                                │
//!                         └──────── re-arm (+period) ◄─────┘
//!                         │
//!                 stop()  ▼
//!                      Stopped   (thread joined, never fires again)
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::device::{Core, DeviceError};
use crate::frame::{self, Frame, FrameGeometry, PatternKind};
use crate::trace::{debug, info, warn};

/// Name of the producer thread.
pub const THREAD_NAME: &str = "simcam-producer";

/// Result of one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// A frame with this sequence number was published.
    Published(u64),
    /// No free buffer was available; the tick was skipped.
    NoBuffer,
    /// Synthesis failed; the tick was skipped.
    Failed,
}

/// The work done on every tick.
///
/// Cheap to clone; every clone publishes into the same device.
#[derive(Debug, Clone)]
pub(crate) struct FireHandler {
    core: Arc<Core>,
    geometry: FrameGeometry,
    pattern: PatternKind,
}

impl FireHandler {
    pub(crate) fn new(core: Arc<Core>, geometry: FrameGeometry, pattern: PatternKind) -> Self {
        Self {
            core,
            geometry,
            pattern,
        }
    }

    /// Draws the next frame, publishes it and wakes every reader.
    ///
    /// Failures are logged and counted; the producer keeps running.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Closed`] if the device closed before the frame landed.
    pub(crate) fn fire(&self) -> Result<FireOutcome, DeviceError> {
        let core = &self.core;
        let Some(pool) = &core.pool else {
            return Ok(FireOutcome::NoBuffer);
        };

        let Some(mut buf) = pool.pop() else {
            core.counters
                .generation_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!("no free frame buffer, skipping tick");
            return Ok(FireOutcome::NoBuffer);
        };

        let seq = core.next_seq();
        if let Err(e) = frame::synthesize(self.pattern, &self.geometry, seq, &mut buf) {
            core.counters
                .generation_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(seq, error = %e, "frame generation failed, skipping tick");
            pool.put_back(buf);
            return Ok(FireOutcome::Failed);
        }

        core.publish(Frame::pooled(seq, buf, pool))?;
        debug!(seq, "frame published");
        Ok(FireOutcome::Published(seq))
    }
}

/// Handle to the running producer thread.
///
/// [`stop`](Self::stop) (or drop) cancels the timer and joins the thread, so
/// once it returns the handler is guaranteed not to be running and never to
/// run again.
#[derive(Debug)]
pub(crate) struct FrameProducer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameProducer {
    /// Arms the timer: the first frame is produced one `period` from now.
    pub(crate) fn spawn(handler: FireHandler, period: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        debug!(period_ms = period.as_millis() as u64, "spawning producer thread");
        let handle = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                info!("producer thread started");
                run(&handler, period, &thread_stop);
                info!("producer thread exiting");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Cancels the timer and waits for an in-progress firing to finish.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            debug!("waiting for producer thread to exit");
            if handle.join().is_err() {
                warn!("producer thread panicked");
            }
        }
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(handler: &FireHandler, period: Duration, stop: &AtomicBool) {
    let mut deadline = Instant::now() + period;
    loop {
        if !sleep_until(deadline, stop) {
            return;
        }

        if handler.fire().is_err() {
            debug!("device closed under the producer");
            return;
        }

        deadline = deadline + period;
        let now = Instant::now();
        if now >= deadline {
            // More than a whole period late: drop the missed ticks.
            debug!("producer fell behind, re-anchoring timer");
            deadline = now + period;
        }
    }
}

/// Parks until `deadline`. Returns `false` once `stop` is set.
fn sleep_until(deadline: Instant, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::park_timeout(deadline - now);
    }
}
