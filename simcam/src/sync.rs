//! Synchronization primitives shared between the producer and readers.
//!
//! Everything here is usable from the producer's fire handler: nothing
//! sleeps while holding a lock, and notification never waits on a reader.

pub mod notify;
pub mod spin;

pub use notify::{NotificationChannel, WaitResult, WakerId, WakerSlotsFull};
pub use spin::{SpinGuard, SpinLock};
