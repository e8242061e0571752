//! Wake-all notification channel.
//!
//! Readers suspend on a futex word holding the current *epoch*; the producer
//! bumps the epoch and issues `FUTEX_WAKE` for every sleeper. Both halves are
//! single syscalls that never block the notifier, so `notify_all` is safe to
//! call from the fire handler.
//!
//! ```text
//!   reader                               producer
//!   ──────                               ────────
//!   e = epoch()
//!   slot.try_take() ── empty
//!   wait(e, deadline) ──┐                publish(frame)
//!                       │ FUTEX_WAIT     notify_all()
//!                       │ (if epoch==e)    epoch += 1
//!                       │◄──────────────── FUTEX_WAKE(all)
//!   slot.try_take() ◄───┘                  wake mio wakers
//! ```
//!
//! Because the futex only sleeps while the word still equals `e`, a publish
//! that lands between `epoch()` and `wait()` is never lost.
//!
//! External multiplexers register a [`mio::Waker`]; it is woken alongside
//! the futex sleepers so a `mio::Poll` can watch the device together with
//! sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;
use rustix::io::Errno;
use rustix::thread::futex;
use rustix::time::Timespec;

use super::spin::SpinLock;
use crate::trace::{trace, warn};

/// Maximum number of external wakers attached to one channel.
pub const MAX_WAKERS: usize = 16;

/// Outcome of a single [`NotificationChannel::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The epoch moved (or the wake was spurious); re-check the condition.
    Woken,
    /// The deadline passed with no notification.
    TimedOut,
    /// The wait was cut short by a signal.
    Interrupted,
}

/// Identifies a registered external waker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakerId(u64);

/// Error registering an external waker.
#[derive(Debug, thiserror::Error)]
#[error("all external waker slots are in use")]
pub struct WakerSlotsFull;

type WakerTable = [Option<(WakerId, Arc<mio::Waker>)>; MAX_WAKERS];

/// The wait/notify primitive shared by the producer and all readers.
pub struct NotificationChannel {
    epoch: AtomicU32,
    sleepers: AtomicU32,
    next_waker_id: AtomicU64,
    wakers: SpinLock<WakerTable>,
}

impl NotificationChannel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: AtomicU32::new(0),
            sleepers: AtomicU32::new(0),
            next_waker_id: AtomicU64::new(0),
            wakers: SpinLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Current wake generation. Read this *before* checking the condition
    /// you intend to wait on.
    #[inline]
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Number of threads currently suspended in [`wait`](Self::wait).
    #[must_use]
    pub fn sleepers(&self) -> u32 {
        self.sleepers.load(Ordering::Relaxed)
    }

    /// Suspends while the epoch still equals `observed`.
    ///
    /// Returns [`WaitResult::Woken`] as soon as the epoch differs, including
    /// when it already differed on entry. Callers must treat `Woken` as a
    /// hint and re-check their condition.
    pub fn wait(&self, observed: u32, deadline: Option<Instant>) -> WaitResult {
        loop {
            if self.epoch.load(Ordering::Acquire) != observed {
                return WaitResult::Woken;
            }

            let timeout = match deadline {
                None => None,
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return WaitResult::TimedOut;
                    }
                    Some(timespec(dl - now))
                }
            };

            self.sleepers.fetch_add(1, Ordering::SeqCst);
            let res = futex::wait(&self.epoch, futex::Flags::PRIVATE, observed, timeout.as_ref());
            self.sleepers.fetch_sub(1, Ordering::SeqCst);

            match res {
                Ok(()) | Err(Errno::AGAIN) => return WaitResult::Woken,
                // Re-evaluated against the deadline at the top of the loop.
                Err(Errno::TIMEDOUT) => {}
                Err(Errno::INTR) => return WaitResult::Interrupted,
                Err(e) => {
                    warn!(error = %e, "futex wait failed, treating as spurious wake");
                    return WaitResult::Woken;
                }
            }
        }
    }

    /// Wakes every suspended reader and every registered waker.
    ///
    /// Never blocks: one atomic add, at most one `FUTEX_WAKE`, and one
    /// eventfd write per registered waker.
    pub fn notify_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if self.sleepers.load(Ordering::SeqCst) > 0 {
            match futex::wake(&self.epoch, futex::Flags::PRIVATE, i32::MAX as u32) {
                Ok(n) => trace!(woken = n, "futex wake"),
                Err(e) => warn!(error = %e, "futex wake failed"),
            }
        }

        let wakers = self.wakers.lock();
        for (id, waker) in wakers.iter().flatten() {
            if let Err(e) = waker.wake() {
                warn!(waker = id.0, error = %e, "external waker failed");
            }
        }
    }

    /// Attaches an external waker that fires on every [`notify_all`](Self::notify_all).
    ///
    /// # Errors
    ///
    /// Returns [`WakerSlotsFull`] when [`MAX_WAKERS`] are already attached.
    pub fn register(&self, waker: Arc<mio::Waker>) -> Result<WakerId, WakerSlotsFull> {
        let id = WakerId(self.next_waker_id.fetch_add(1, Ordering::Relaxed));
        let mut wakers = self.wakers.lock();
        let free = wakers.iter_mut().find(|w| w.is_none()).ok_or(WakerSlotsFull)?;
        *free = Some((id, waker));
        Ok(id)
    }

    /// Detaches a waker. Returns `false` if `id` was not registered.
    pub fn deregister(&self, id: WakerId) -> bool {
        let removed = {
            let mut wakers = self.wakers.lock();
            wakers
                .iter_mut()
                .find(|w| matches!(w, Some((wid, _)) if *wid == id))
                .and_then(|w| w.take())
        };
        // The Arc is released outside the critical section.
        removed.is_some()
    }

    /// Number of attached external wakers.
    #[must_use]
    pub fn waker_count(&self) -> usize {
        self.wakers.lock().iter().filter(|w| w.is_some()).count()
    }
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("epoch", &self.epoch())
            .field("sleepers", &self.sleepers())
            .finish_non_exhaustive()
    }
}

fn timespec(d: Duration) -> Timespec {
    Timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    }
}
