//! Recycled frame buffers.
//!
//! Frame buffers are allocated once when the device opens and then circulate:
//! producer → slot → reader → pool → producer. The pool is a bounded
//! lock-free ring so both the producer's fire handler and any number of
//! readers can touch it without blocking.
//!
//! # Algorithm
//!
//! Dmitry Vyukov's bounded MPMC queue. Every cell carries a sequence number:
//!
//! - Initially `seq == index`.
//! - A pusher claims position `pos` when `seq == pos`, writes, then stores
//!   `seq = pos + 1`.
//! - A popper claims position `pos` when `seq == pos + 1`, reads, then stores
//!   `seq = pos + capacity` so the cell is free for the next lap.
//!
//! Both ends claim positions with a CAS on their own cursor, so any number of
//! threads may push and pop concurrently.
//!
//! Only buffers the pool allocated itself are ever pushed, and the ring has
//! room for all of them, so a push can only fail while a concurrent pop is
//! between its CAS and its sequence store.

use std::cell::UnsafeCell;
use std::collections::TryReserveError;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(align(64))]
struct Cell {
    seq: AtomicUsize,
    buf: UnsafeCell<MaybeUninit<Box<[u8]>>>,
}

/// Cursor on its own cache line so pushers and poppers do not false-share.
#[repr(align(64))]
struct Cursor(AtomicUsize);

/// Bounded pool of equally sized byte buffers.
pub struct BufferPool {
    cells: Box<[Cell]>,
    head: Cursor,
    tail: Cursor,
    buf_len: usize,
}

// SAFETY: each cell's payload is only touched by the thread that won the CAS
// for its position, and the sequence store publishes the write.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Creates a pool able to hold `capacity` buffers of `buf_len` bytes and
    /// pre-fills it with `prefill` freshly allocated buffers.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error if any buffer cannot be reserved.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0` or `prefill > capacity`.
    pub fn with_buffers(
        capacity: usize,
        buf_len: usize,
        prefill: usize,
    ) -> Result<Self, TryReserveError> {
        assert!(capacity > 0, "pool capacity must be greater than 0");
        assert!(prefill <= capacity, "cannot prefill beyond capacity");

        let mut cells = Vec::new();
        cells.try_reserve_exact(capacity)?;
        cells.extend((0..capacity).map(|i| Cell {
            seq: AtomicUsize::new(i),
            buf: UnsafeCell::new(MaybeUninit::uninit()),
        }));

        let pool = Self {
            cells: cells.into_boxed_slice(),
            head: Cursor(AtomicUsize::new(0)),
            tail: Cursor(AtomicUsize::new(0)),
            buf_len,
        };

        for _ in 0..prefill {
            let buf = alloc_zeroed(buf_len)?;
            if pool.push(buf).is_err() {
                unreachable!("prefill is bounded by capacity");
            }
        }
        Ok(pool)
    }

    /// Length of every buffer in the pool.
    #[must_use]
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Returns a buffer to the pool, retrying while a racing pop finishes.
    ///
    /// A buffer of the wrong length is dropped.
    pub(crate) fn put_back(&self, mut buf: Box<[u8]>) {
        let mut spins = 0u32;
        loop {
            match self.push(buf) {
                Ok(()) => return,
                Err(back) if back.len() != self.buf_len => return,
                Err(back) => {
                    buf = back;
                    spins += 1;
                    if spins < 64 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// Returns a buffer to the pool.
    ///
    /// `Err(buf)` if the ring looks full or the buffer has the wrong length.
    pub(crate) fn push(&self, buf: Box<[u8]>) -> Result<(), Box<[u8]>> {
        if buf.len() != self.buf_len {
            return Err(buf);
        }
        let cap = self.cells.len();
        let mut pos = self.head.0.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos % cap];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS at `pos` with `seq == pos`
                        // gives this thread exclusive write access to the cell.
                        unsafe { (*cell.buf.get()).write(buf) };
                        cell.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(buf);
            } else {
                pos = self.head.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Takes a buffer out of the pool, or `None` if it is empty.
    pub fn pop(&self) -> Option<Box<[u8]>> {
        let cap = self.cells.len();
        let mut pos = self.tail.0.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos % cap];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.tail.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: `seq == pos + 1` means a pusher finished
                        // writing, and the CAS makes this thread its only reader.
                        let buf = unsafe { (*cell.buf.get()).assume_init_read() };
                        cell.seq.store(pos.wrapping_add(cap), Ordering::Release);
                        return Some(buf);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.tail.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of buffers currently pooled.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.cells.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("buf_len", &self.buf_len)
            .field("len", &self.len())
            .finish()
    }
}

/// Allocates a zeroed buffer, reporting failure instead of aborting.
///
/// # Errors
///
/// Returns the allocator's error when `len` bytes cannot be reserved.
pub fn alloc_zeroed(len: usize) -> Result<Box<[u8]>, TryReserveError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, 0);
    Ok(v.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn prefill_and_drain() {
        let pool = BufferPool::with_buffers(4, 16, 3).unwrap();
        assert_eq!(pool.len(), 3);
        for _ in 0..3 {
            let buf = pool.pop().unwrap();
            assert_eq!(buf.len(), 16);
        }
        assert!(pool.pop().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn rejects_when_full() {
        let pool = BufferPool::with_buffers(2, 8, 2).unwrap();
        let extra = alloc_zeroed(8).unwrap();
        assert!(pool.push(extra).is_err());

        let b = pool.pop().unwrap();
        assert!(pool.push(b).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        let pool = BufferPool::with_buffers(2, 8, 0).unwrap();
        assert!(pool.push(alloc_zeroed(7).unwrap()).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn wraps_over_many_laps() {
        let pool = BufferPool::with_buffers(3, 4, 0).unwrap();
        for lap in 0..10u8 {
            for i in 0..3u8 {
                pool.push(vec![lap, i, 0, 0].into_boxed_slice()).unwrap();
            }
            for i in 0..3u8 {
                assert_eq!(&pool.pop().unwrap()[..2], &[lap, i]);
            }
        }
    }

    #[test]
    fn concurrent_push_pop_conserves_buffers() {
        let pool = Arc::new(BufferPool::with_buffers(8, 32, 8).unwrap());
        let rounds = 2_000;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut done = 0;
                    while done < rounds {
                        if let Some(buf) = pool.pop() {
                            pool.put_back(buf);
                            done += 1;
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.len(), 8);
    }
}
