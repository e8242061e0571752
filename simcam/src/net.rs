//! Network transport primitives.
//!
//! Thin mio-based TCP wrappers used by the relay. Endpoints are plain
//! address/port pairs shared with the configuration layer.

pub mod endpoint;
pub mod stream;

pub use endpoint::Endpoint;
pub use stream::{StreamListener, StreamSocket};
