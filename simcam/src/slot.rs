//! Single-frame mailbox shared by the producer and every reader.
//!
//! The slot holds at most one [`Frame`]. Publishing replaces whatever is there
//! (latest wins); taking empties it, so each published frame is delivered to
//! exactly one reader. Frame payloads are moved in and out as boxed buffers,
//! which keeps the critical section to a pointer swap regardless of frame
//! size.
//!
//! Overwritten frames are dropped silently from the readers' point of view:
//! the displaced frame is handed back to the publisher, which drops it outside
//! the lock, and a trace event is emitted, but no counter or flag reaches the
//! consumer side.
//!
//! Once [`close`](SharedFrameSlot::close) has run, every publish is refused,
//! so a closed slot never turns ready again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::frame::Frame;
use crate::sync::SpinLock;
use crate::trace::trace;

/// Sequence value reported before the first publish.
pub const NO_SEQ: u64 = u64::MAX;

/// A publish that arrived after the slot was closed; carries the frame back.
#[derive(Debug, thiserror::Error)]
#[error("slot is closed")]
pub struct SlotClosed(pub Frame);

/// The shared mailbox.
///
/// `ready` mirrors `frame.is_some()` and is only written while the lock is
/// held, so [`peek_ready`](Self::peek_ready) can read it without locking and
/// still never disagree with a subsequent [`try_take`](Self::try_take) that
/// nobody raced.
pub struct SharedFrameSlot {
    frame: SpinLock<Option<Frame>>,
    ready: AtomicBool,
    closed: AtomicBool,
    last_seq: AtomicU64,
}

impl SharedFrameSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frame: SpinLock::new(None),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_seq: AtomicU64::new(NO_SEQ),
        }
    }

    /// Stores `frame` and marks the slot ready.
    ///
    /// Returns the unconsumed frame this publish displaced, if any. Safe to
    /// call from the producer's fire handler: the lock is held only for the
    /// swap and nothing is freed inside it.
    ///
    /// # Errors
    ///
    /// [`SlotClosed`] with the frame if the slot has been closed.
    pub fn publish(&self, frame: Frame) -> Result<Option<Frame>, SlotClosed> {
        let seq = frame.seq();
        let displaced = {
            let mut slot = self.frame.lock();
            if self.closed.load(Ordering::Acquire) {
                drop(slot);
                return Err(SlotClosed(frame));
            }
            let old = slot.replace(frame);
            self.ready.store(true, Ordering::Release);
            self.last_seq.store(seq, Ordering::Release);
            old
        };
        if let Some(old) = &displaced {
            trace!(dropped = old.seq(), replaced_by = seq, "unconsumed frame overwritten");
        }
        Ok(displaced)
    }

    /// Takes the frame if one is ready. Never blocks beyond the swap.
    ///
    /// When several callers race on one ready frame exactly one of them gets
    /// it; the others see `None`.
    #[must_use]
    pub fn try_take(&self) -> Option<Frame> {
        if !self.ready.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.frame.lock();
        let frame = slot.take();
        self.ready.store(false, Ordering::Release);
        frame
    }

    /// Whether an unconsumed frame is present. Does not modify the slot.
    #[inline]
    #[must_use]
    pub fn peek_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Sequence number of the most recent publish, or [`NO_SEQ`].
    #[must_use]
    pub fn last_published_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    /// Marks the slot as shutting down and hands back any pending frame.
    pub fn close(&self) -> Option<Frame> {
        let mut slot = self.frame.lock();
        self.closed.store(true, Ordering::Release);
        self.ready.store(false, Ordering::Release);
        slot.take()
    }

    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for SharedFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedFrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrameSlot")
            .field("ready", &self.peek_ready())
            .field("closed", &self.is_closed())
            .field("last_seq", &self.last_published_seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn frame(seq: u64, len: usize) -> Frame {
        Frame::new(seq, vec![seq as u8; len].into_boxed_slice())
    }

    #[test]
    fn empty_slot() {
        let slot = SharedFrameSlot::new();
        assert!(!slot.peek_ready());
        assert!(slot.try_take().is_none());
        assert_eq!(slot.last_published_seq(), NO_SEQ);
    }

    #[test]
    fn publish_then_take() {
        let slot = SharedFrameSlot::new();
        assert!(slot.publish(frame(1, 8)).unwrap().is_none());
        assert!(slot.peek_ready());

        let f = slot.try_take().unwrap();
        assert_eq!(f.seq(), 1);
        assert!(!slot.peek_ready());
        assert!(slot.try_take().is_none());
    }

    #[test]
    fn latest_wins() {
        let slot = SharedFrameSlot::new();
        slot.publish(frame(1, 8)).unwrap();
        let displaced = slot.publish(frame(2, 8)).unwrap().unwrap();
        assert_eq!(displaced.seq(), 1);
        slot.publish(frame(3, 8)).unwrap();

        assert_eq!(slot.try_take().unwrap().seq(), 3);
        assert_eq!(slot.last_published_seq(), 3);
    }

    #[test]
    fn peek_is_side_effect_free() {
        let slot = SharedFrameSlot::new();
        slot.publish(frame(7, 4)).unwrap();
        for _ in 0..1000 {
            assert!(slot.peek_ready());
        }
        assert_eq!(slot.try_take().unwrap().seq(), 7);
    }

    #[test]
    fn close_returns_pending_frame() {
        let slot = SharedFrameSlot::new();
        slot.publish(frame(5, 4)).unwrap();
        assert_eq!(slot.close().unwrap().seq(), 5);
        assert!(slot.is_closed());
        assert!(!slot.peek_ready());
    }

    #[test]
    fn publish_after_close_is_refused() {
        let slot = SharedFrameSlot::new();
        slot.close();
        let SlotClosed(back) = slot.publish(frame(9, 4)).unwrap_err();
        assert_eq!(back.seq(), 9);
        assert!(!slot.peek_ready());
        assert!(slot.try_take().is_none());
        assert_eq!(slot.last_published_seq(), NO_SEQ);
    }

    #[test]
    fn no_torn_frames_and_no_duplicates() {
        const LEN: usize = 4096;
        const FRAMES: u64 = 5_000;

        let slot = Arc::new(SharedFrameSlot::new());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let slot = Arc::clone(&slot);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        if let Some(f) = slot.try_take() {
                            let first = f.as_bytes()[0];
                            assert!(
                                f.as_bytes().iter().all(|&b| b == first),
                                "torn frame {}",
                                f.seq()
                            );
                            assert_eq!(first, f.seq() as u8);
                            seen.push(f.seq());
                        } else if done.load(Ordering::Acquire) {
                            break;
                        } else {
                            thread::yield_now();
                        }
                    }
                    seen
                })
            })
            .collect();

        for seq in 0..FRAMES {
            slot.publish(frame(seq, LEN)).unwrap();
        }
        done.store(true, Ordering::Release);

        let mut all = HashSet::new();
        for r in readers {
            for seq in r.join().unwrap() {
                assert!(all.insert(seq), "frame {seq} delivered twice");
            }
        }
        // Whatever was not read is either still in the slot or was overwritten.
        if let Some(f) = slot.try_take() {
            assert!(all.insert(f.seq()));
        }
    }
}
