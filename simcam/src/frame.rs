//! Frame payloads and test-pattern synthesis.
//!
//! A [`Frame`] is a fixed-size byte buffer tagged with a sequence number.
//! Its size is chosen once per device (see [`FrameGeometry`]) and every
//! buffer the device hands out has exactly that length.

use std::io::Write;
use std::mem;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::pool::BufferPool;

/// Largest 12-bit raw sample value plus one.
const RAW12_RANGE: u32 = 4096;

/// Frame layout for the simulated sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per sample. Two bytes hold one RAW12 sample.
    pub bytes_per_sample: u32,
}

impl FrameGeometry {
    /// 640×480 RAW12 stored as 16-bit samples.
    pub const VGA_RAW12: Self = Self {
        width: 640,
        height: 480,
        bytes_per_sample: 2,
    };

    #[must_use]
    pub const fn new(width: u32, height: u32, bytes_per_sample: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_sample,
        }
    }

    /// Total payload size in bytes.
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(self.bytes_per_sample as usize)
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::VGA_RAW12
    }
}

/// What the producer draws into each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// Diagonal RAW12 gradient shifted by the frame index.
    #[default]
    Gradient,
    /// A short `frame <n>` text record, zero padded.
    Text,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer does not match the geometry it is being drawn for.
    #[error("buffer is {have} bytes, geometry needs {need}")]
    SizeMismatch { need: usize, have: usize },
    /// The text record does not fit.
    #[error("text record needs {need} bytes, buffer has {have}")]
    TooSmall { need: usize, have: usize },
}

/// A published frame. Immutable once it leaves the producer.
///
/// A frame drawn from a device's buffer pool returns its buffer there when
/// dropped, so readers never have to hand frames back by hand.
#[derive(Debug)]
pub struct Frame {
    seq: u64,
    data: Box<[u8]>,
    home: Option<Weak<BufferPool>>,
}

impl Frame {
    /// Wraps a filled buffer. `seq` must be unique per device.
    #[must_use]
    pub fn new(seq: u64, data: Box<[u8]>) -> Self {
        Self {
            seq,
            data,
            home: None,
        }
    }

    /// Wraps a buffer popped from `pool`; dropping the frame pushes it back.
    pub(crate) fn pooled(seq: u64, data: Box<[u8]>, pool: &Arc<BufferPool>) -> Self {
        Self {
            seq,
            data,
            home: Some(Arc::downgrade(pool)),
        }
    }

    #[inline]
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies as much of the payload as fits into `dst`; the rest is dropped.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        n
    }

    /// Keeps the buffer instead of returning it to the device's pool.
    ///
    /// The producer allocates nothing, so every buffer kept this way is one
    /// fewer in circulation.
    #[must_use]
    pub fn into_buffer(mut self) -> Box<[u8]> {
        self.home = None;
        mem::take(&mut self.data)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pool) = self.home.take().and_then(|home| home.upgrade()) {
            pool.put_back(mem::take(&mut self.data));
        }
    }
}

/// Draws frame number `index` into `buf`.
///
/// Never allocates, so it is usable from the producer's fire handler.
///
/// # Errors
///
/// [`FrameError::SizeMismatch`] if `buf` is not `geometry.frame_size()` long;
/// [`FrameError::TooSmall`] if a text record does not fit.
pub fn synthesize(
    kind: PatternKind,
    geometry: &FrameGeometry,
    index: u64,
    buf: &mut [u8],
) -> Result<(), FrameError> {
    let need = geometry.frame_size();
    if buf.len() != need {
        return Err(FrameError::SizeMismatch {
            need,
            have: buf.len(),
        });
    }
    match kind {
        PatternKind::Gradient => {
            gradient(geometry, index, buf);
            Ok(())
        }
        PatternKind::Text => text_record(index, buf),
    }
}

/// Sample value at (`row`, `col`) of frame `index`.
#[inline]
#[must_use]
pub fn gradient_sample(row: u32, col: u32, index: u64) -> u16 {
    // Wrapping keeps the pattern periodic once index * 10 exceeds u32.
    let base = row
        .wrapping_add(col)
        .wrapping_add((index as u32).wrapping_mul(10));
    (base.wrapping_mul(16) % RAW12_RANGE) as u16
}

fn gradient(geometry: &FrameGeometry, index: u64, buf: &mut [u8]) {
    let bps = geometry.bytes_per_sample as usize;
    if bps == 0 {
        return;
    }
    let width = geometry.width as usize;
    for (i, sample) in buf.chunks_exact_mut(bps).enumerate() {
        let row = (i / width) as u32;
        let col = (i % width) as u32;
        let le = gradient_sample(row, col, index).to_le_bytes();
        for (b, byte) in sample.iter_mut().enumerate() {
            *byte = le[b % le.len()];
        }
    }
}

fn text_record(index: u64, buf: &mut [u8]) -> Result<(), FrameError> {
    let have = buf.len();
    let mut cursor = &mut buf[..];
    if writeln!(cursor, "frame {index}").is_err() {
        return Err(FrameError::TooSmall {
            need: format_len(index),
            have,
        });
    }
    let written = have - cursor.len();
    buf[written..].fill(0);
    Ok(())
}

fn format_len(index: u64) -> usize {
    // "frame " + digits + "\n"
    let digits = index.checked_ilog10().map_or(1, |d| d as usize + 1);
    6 + digits + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vga_raw12_size() {
        assert_eq!(FrameGeometry::VGA_RAW12.frame_size(), 614_400);
    }

    #[test]
    fn gradient_matches_reference_formula() {
        let geo = FrameGeometry::new(8, 4, 2);
        let mut buf = vec![0u8; geo.frame_size()];
        synthesize(PatternKind::Gradient, &geo, 3, &mut buf).unwrap();

        for row in 0..4u32 {
            for col in 0..8u32 {
                let i = (row * 8 + col) as usize * 2;
                let got = u16::from_le_bytes([buf[i], buf[i + 1]]);
                let want = (((row + col + 3 * 10) * 16) % 4096) as u16;
                assert_eq!(got, want, "row {row} col {col}");
            }
        }
    }

    #[test]
    fn consecutive_frames_differ() {
        let geo = FrameGeometry::new(16, 16, 2);
        let mut a = vec![0u8; geo.frame_size()];
        let mut b = vec![0u8; geo.frame_size()];
        synthesize(PatternKind::Gradient, &geo, 1, &mut a).unwrap();
        synthesize(PatternKind::Gradient, &geo, 2, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn text_record_is_zero_padded() {
        let geo = FrameGeometry::new(32, 1, 1);
        let mut buf = vec![0xAAu8; 32];
        synthesize(PatternKind::Text, &geo, 42, &mut buf).unwrap();
        assert_eq!(&buf[..9], b"frame 42\n");
        assert!(buf[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn text_record_too_small() {
        let geo = FrameGeometry::new(4, 1, 1);
        let mut buf = vec![0u8; 4];
        let err = synthesize(PatternKind::Text, &geo, 12345, &mut buf).unwrap_err();
        assert_eq!(err, FrameError::TooSmall { need: 12, have: 4 });
    }

    #[test]
    fn size_mismatch_rejected() {
        let geo = FrameGeometry::new(4, 4, 2);
        let mut buf = vec![0u8; 10];
        assert_eq!(
            synthesize(PatternKind::Gradient, &geo, 0, &mut buf),
            Err(FrameError::SizeMismatch { need: 32, have: 10 })
        );
    }

    #[test]
    fn copy_to_truncates() {
        let frame = Frame::new(1, vec![1, 2, 3, 4].into_boxed_slice());
        let mut dst = [0u8; 2];
        assert_eq!(frame.copy_to(&mut dst), 2);
        assert_eq!(dst, [1, 2]);
    }

    #[test]
    fn dropping_a_pooled_frame_returns_its_buffer() {
        let pool = Arc::new(BufferPool::with_buffers(4, 8, 2).unwrap());
        let frame = Frame::pooled(1, pool.pop().unwrap(), &pool);
        assert_eq!(pool.len(), 1);
        drop(frame);
        assert_eq!(pool.len(), 2);

        let kept = Frame::pooled(2, pool.pop().unwrap(), &pool).into_buffer();
        assert_eq!(kept.len(), 8);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pooled_frame_outliving_its_pool_just_frees() {
        let pool = Arc::new(BufferPool::with_buffers(2, 8, 1).unwrap());
        let frame = Frame::pooled(1, pool.pop().unwrap(), &pool);
        drop(pool);
        assert_eq!(frame.len(), 8);
        drop(frame);
    }
}
