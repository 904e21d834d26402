//! Frame and pixel buffer types for the sky-monitoring acquisition pipeline.
//!
//! A [`Frame`] is immutable once published: every consumer (the ring buffer,
//! the stacker, the detector, the event recorder) holds a cheap `Arc` clone
//! of the same pixel buffer rather than a private copy. The last dropper
//! frees the backing storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod mask;

pub use mask::Mask;

/// Bit depth of a captured frame's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDepth {
    Eight,
    Sixteen,
}

impl PixelDepth {
    pub fn max_value(self) -> u32 {
        match self {
            PixelDepth::Eight => u8::MAX as u32,
            PixelDepth::Sixteen => u16::MAX as u32,
        }
    }
}

/// Errors raised constructing or indexing a [`Frame`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("pixel buffer length {actual} does not match width*height {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("coordinate ({x}, {y}) out of bounds for {width}x{height} frame")]
    OutOfBounds { x: u32, y: u32, width: u32, height: u32 },
}

/// Single-channel pixel storage, shared read-only behind an `Arc`.
///
/// Consumers clone the `Arc`, never the pixels: eviction from the ring
/// buffer only actually frees memory once the last consumer handle drops.
#[derive(Debug, Clone)]
pub enum PixelBuffer {
    Eight(Arc<[u8]>),
    Sixteen(Arc<[u16]>),
}

impl PixelBuffer {
    pub fn depth(&self) -> PixelDepth {
        match self {
            PixelBuffer::Eight(_) => PixelDepth::Eight,
            PixelBuffer::Sixteen(_) => PixelDepth::Sixteen,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::Eight(b) => b.len(),
            PixelBuffer::Sixteen(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a pixel as a widened `u32`, regardless of underlying depth.
    pub fn get(&self, idx: usize) -> Option<u32> {
        match self {
            PixelBuffer::Eight(b) => b.get(idx).map(|v| *v as u32),
            PixelBuffer::Sixteen(b) => b.get(idx).map(|v| *v as u32),
        }
    }

    /// Materialize the buffer as owned `f32` samples (used by the stacker's
    /// accumulators and the detector's background model).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            PixelBuffer::Eight(b) => b.iter().map(|&v| v as f32).collect(),
            PixelBuffer::Sixteen(b) => b.iter().map(|&v| v as f32).collect(),
        }
    }
}

/// One acquired image plus its acquisition metadata.
///
/// Immutable once published. `sequence` is strictly increasing per source;
/// `pixels` is shared read-only among every consumer holding this `Frame`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: PixelBuffer,
    pub width: u32,
    pub height: u32,
    /// Acquisition timestamp, UTC, millisecond precision.
    pub timestamp: DateTime<Utc>,
    /// Monotonic sequence number from source start.
    pub sequence: u64,
    pub gain: f32,
    pub exposure_ms: f32,
    pub source_tag: String,
}

impl Frame {
    pub fn new(
        pixels: PixelBuffer,
        width: u32,
        height: u32,
        timestamp: DateTime<Utc>,
        sequence: u64,
        gain: f32,
        exposure_ms: f32,
        source_tag: impl Into<String>,
    ) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize);
        if pixels.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            timestamp,
            sequence,
            gain,
            exposure_ms,
            source_tag: source_tag.into(),
        })
    }

    pub fn depth(&self) -> PixelDepth {
        self.pixels.depth()
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> Result<u32, FrameError> {
        if x >= self.width || y >= self.height {
            return Err(FrameError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        let idx = (y * self.width + x) as usize;
        Ok(self.pixels.get(idx).expect("bounds checked above"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Frame {
        let data: Arc<[u8]> = Arc::from(vec![0u8; 4]);
        Frame::new(
            PixelBuffer::Eight(data),
            2,
            2,
            Utc::now(),
            seq,
            1.0,
            10.0,
            "test",
        )
        .unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer_size() {
        let data: Arc<[u8]> = Arc::from(vec![0u8; 3]);
        let err = Frame::new(PixelBuffer::Eight(data), 2, 2, Utc::now(), 0, 1.0, 1.0, "x")
            .unwrap_err();
        assert_eq!(
            err,
            FrameError::SizeMismatch {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn get_pixel_bounds_checked() {
        let f = frame(0);
        assert!(f.get_pixel(1, 1).is_ok());
        assert!(f.get_pixel(2, 0).is_err());
    }

    #[test]
    fn sequence_is_carried() {
        let f = frame(42);
        assert_eq!(f.sequence, 42);
    }

    #[test]
    fn arc_clone_is_cheap_shared_view() {
        let f = frame(1);
        let clone = f.pixels.clone();
        match (&f.pixels, &clone) {
            (PixelBuffer::Eight(a), PixelBuffer::Eight(b)) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("expected matching variants"),
        }
    }
}
