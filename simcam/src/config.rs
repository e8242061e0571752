//! Runtime configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file) describes the stock camera streaming five frames on port 8080.
//!
//! ```toml
//! [device]
//! kind = "frame-producing"
//! period_ms = 2000
//! pattern = "gradient"
//!
//! [device.geometry]
//! width = 640
//! height = 480
//! bytes_per_sample = 2
//!
//! [relay]
//! bind = "0.0.0.0:8080"
//! frame_budget = 5
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{DEFAULT_FRAME_BUFFERS, DEFAULT_PERIOD, DEFAULT_SIMPLE_CAPACITY, DeviceKind};
use crate::frame::{FrameGeometry, PatternKind};
use crate::net::Endpoint;

/// Frames the relay sends before closing the connection.
pub const DEFAULT_FRAME_BUDGET: u64 = 5;

/// How often blocked relay calls re-check the shutdown flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub device: DeviceConfig,
    pub relay: RelayConfig,
}

/// Device variant selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceVariant {
    /// Echo device: frames come from writes.
    SimpleBuffer,
    #[default]
    FrameProducing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub kind: DeviceVariant,
    pub geometry: FrameGeometry,
    pub pattern: PatternKind,
    /// Producer period in milliseconds.
    pub period_ms: u64,
    /// Frame buffers in circulation.
    pub buffers: usize,
    /// Capacity of a simple-buffer device.
    pub capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceVariant::FrameProducing,
            geometry: FrameGeometry::VGA_RAW12,
            pattern: PatternKind::Gradient,
            period_ms: DEFAULT_PERIOD.as_millis() as u64,
            buffers: DEFAULT_FRAME_BUFFERS,
            capacity: DEFAULT_SIMPLE_CAPACITY,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// The device this configuration describes.
    #[must_use]
    pub fn kind(&self) -> DeviceKind {
        match self.kind {
            DeviceVariant::SimpleBuffer => DeviceKind::SimpleBuffer {
                capacity: self.capacity,
            },
            DeviceVariant::FrameProducing => DeviceKind::FrameProducing {
                geometry: self.geometry,
                pattern: self.pattern,
                period: Some(self.period()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Listen address.
    pub bind: Endpoint,
    /// Frames sent to the client before the relay exits.
    pub frame_budget: u64,
    /// Shutdown-flag check interval in milliseconds.
    pub poll_interval_ms: u64,
    /// `SO_SNDBUF` for the client connection; kernel default if unset.
    pub send_buffer_size: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::default(),
            frame_budget: DEFAULT_FRAME_BUDGET,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            send_buffer_size: None,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] if the values fail [`validate`](Self::validate).
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as for
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Checks values serde cannot rule out on its own.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let device = &self.device;
        match device.kind {
            DeviceVariant::FrameProducing => {
                if device.geometry.frame_size() == 0 {
                    return Err(invalid("device.geometry must describe a non-empty frame"));
                }
                if device.period_ms == 0 {
                    return Err(invalid("device.period_ms must be greater than 0"));
                }
                if device.buffers < 2 {
                    return Err(invalid("device.buffers must be at least 2"));
                }
            }
            DeviceVariant::SimpleBuffer => {
                if device.capacity == 0 {
                    return Err(invalid("device.capacity must be greater than 0"));
                }
            }
        }
        if self.relay.poll_interval_ms == 0 {
            return Err(invalid("relay.poll_interval_ms must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_owned())
}
