//! A simulated camera device: a timer-driven producer publishes frames into a
//! single-slot mailbox, readers block, poll or read non-blocking, and a TCP
//! relay streams a bounded number of frames to one client.
//!
//! # Architecture
//!
//! ```text
//!   FrameProducer ──publish──► SharedFrameSlot ◄──take── Reader ──► Relay ──► TCP client
//!        │                                                  ▲
//!        └──notify_all──► NotificationChannel ──wake────────┘
//!                          (futex + mio wakers)
//! ```
//!
//! A [`Device`] owns every piece; readers borrow it. Frame buffers are
//! allocated once and recycled through a lock-free pool, so the producer's
//! fire handler never allocates.
//!
//! # Example
//!
//! ```no_run
//! use simcam::{Device, DeviceKind, ReadMode};
//!
//! let device = Device::open(DeviceKind::camera())?;
//! let reader = device.reader();
//! let mut buf = vec![0u8; device.frame_size()];
//! let n = reader.read(&mut buf, ReadMode::BLOCKING)?;
//! assert_eq!(n, 640 * 480 * 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod consumer;
pub mod device;
pub mod frame;
pub mod net;
pub mod pool;
pub mod producer;
pub mod relay;
pub mod slot;
pub mod sync;
mod trace;

pub use config::{Config, ConfigError, DeviceConfig, DeviceVariant, RelayConfig};
pub use consumer::{CancelToken, PollEvents, ReadError, ReadMode, ReadOutcome, Reader, WakerGuard};
pub use device::{Device, DeviceError, DeviceKind, DeviceStats};
pub use frame::{Frame, FrameError, FrameGeometry, PatternKind};
pub use net::Endpoint;
pub use producer::FireOutcome;
pub use relay::{Relay, RelayEnd, RelayError, RelayReport};
pub use slot::{SharedFrameSlot, SlotClosed};
pub use sync::{NotificationChannel, WaitResult};
pub use trace::init_tracing;
