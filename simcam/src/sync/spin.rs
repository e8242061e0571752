//! Ticket spinlock for critical sections shared with the producer.
//!
//! The producer's fire handler may not sleep, so anything it touches is
//! guarded by this lock rather than a `Mutex`. Holders must keep the critical
//! section to a pointer swap or a few loads; no allocation, no I/O, no
//! copying of frame payloads while the lock is held.
//!
//! Tickets make the lock FIFO-fair: a reader hammering `try_take` cannot
//! starve the producer.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

/// A FIFO ticket spinlock.
pub struct SpinLock<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the ticket protocol, so the lock
// may be shared between threads whenever `T` can be sent between them.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates an unlocked spinlock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            std::hint::spin_loop();
        }
        SpinGuard {
            lock: self,
            _unsend: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let serving = self.now_serving.load(Ordering::Relaxed);
        let next = self.next_ticket.load(Ordering::Relaxed);
        f.debug_struct("SpinLock")
            .field("locked", &(serving != next))
            .finish_non_exhaustive()
    }
}

/// RAII guard; releases the lock on drop.
///
/// Not `Send`: the ticket must be returned by the thread that took it.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    _unsend: PhantomData<*const ()>,
}

// SAFETY: sharing the guard only hands out `&T`.
unsafe impl<T: Sync> Sync for SpinGuard<'_, T> {}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while this thread holds the ticket.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while this thread holds the ticket.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        let serving = self.lock.now_serving.load(Ordering::Relaxed);
        self.lock
            .now_serving
            .store(serving.wrapping_add(1), Ordering::Release);
    }
}
