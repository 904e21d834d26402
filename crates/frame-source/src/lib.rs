//! Polymorphic frame producers.
//!
//! A [`FrameSource`] blocks in [`FrameSource::run`], repeatedly producing a
//! [`sky_frame::Frame`] and publishing it into a [`ring_buffer::RingBuffer`]
//! until [`FrameSource::stop`] is called. Three variants share one contract:
//! `LiveCamera` (a real device behind the abstract [`CameraDevice`]
//! capability), `VideoFile` (paced replay of a decoded file), and
//! `FrameDirectory` (paced replay of numbered still frames on disk).

mod device;
mod directory;
mod video;

pub use device::{CameraDevice, LiveCamera};
pub use directory::{FrameDirectory, FrameFileReader, ImageFileReader};
pub use video::{VideoDecoder, VideoFile};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ring_buffer::RingBuffer;
use sky_frame::{Frame, PixelBuffer, PixelDepth};
use thiserror::Error;

/// Error taxonomy for a frame source: `Transient` is retried by the
/// producer itself, `Disconnected` is an unrecoverable DeviceError the
/// Supervisor must see, everything else is fatal at open time.
#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("device open/configure failed: {0}")]
    Open(String),
    #[error("transient acquisition error: {0}")]
    Transient(String),
    #[error("device disconnected")]
    Disconnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Static capture metadata a source exposes up front.
#[derive(Debug, Clone, Copy)]
pub struct SourceMetadata {
    pub depth: PixelDepth,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl SourceMetadata {
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

/// A decoded raw frame handed up from a device/decoder/reader, before it is
/// wrapped into a [`sky_frame::Frame`] with a sequence number assigned by
/// the producer loop.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub pixels: PixelBuffer,
    pub width: u32,
    pub height: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub gain: f32,
    pub exposure_ms: f32,
}

/// Shared context every producer loop runs against.
pub struct RunContext {
    pub ring: Arc<RingBuffer>,
    pub stop: Arc<AtomicBool>,
    pub source_tag: String,
}

impl RunContext {
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Wrap a `RawFrame` with the next sequence number and publish it.
    /// `fallback_start` + `seq / fps` synthesizes a timestamp when the raw
    /// frame doesn't carry a hardware one (VideoFile, FrameDirectory).
    pub fn publish(
        &self,
        raw: RawFrame,
        seq: u64,
        fallback_start: DateTime<Utc>,
        fps: f64,
    ) -> Result<(), FrameSourceError> {
        let timestamp = raw
            .timestamp
            .unwrap_or_else(|| fallback_start + chrono::Duration::milliseconds((seq as f64 / fps * 1000.0) as i64));
        let frame = Frame::new(
            raw.pixels,
            raw.width,
            raw.height,
            timestamp,
            seq,
            raw.gain,
            raw.exposure_ms,
            self.source_tag.clone(),
        )
        .map_err(|e| FrameSourceError::Decode(e.to_string()))?;
        self.ring.push(frame);
        Ok(())
    }
}

/// A producer of a monotonically timestamped frame stream.
pub trait FrameProducer: Send {
    fn metadata(&self) -> SourceMetadata;
    /// Blocks until `ctx.stop` is observed, producing frames into
    /// `ctx.ring`. Must return within one frame period after the next
    /// push once stop is requested.
    fn run(&mut self, ctx: &RunContext) -> Result<(), FrameSourceError>;
}

/// The three concrete producer variants, dispatched without an inheritance
/// hierarchy.
pub enum FrameSource {
    LiveCamera(LiveCamera),
    VideoFile(VideoFile),
    FrameDirectory(FrameDirectory),
}

impl FrameSource {
    pub fn metadata(&self) -> SourceMetadata {
        match self {
            FrameSource::LiveCamera(s) => s.metadata(),
            FrameSource::VideoFile(s) => s.metadata(),
            FrameSource::FrameDirectory(s) => s.metadata(),
        }
    }

    pub fn run(&mut self, ctx: &RunContext) -> Result<(), FrameSourceError> {
        match self {
            FrameSource::LiveCamera(s) => s.run(ctx),
            FrameSource::VideoFile(s) => s.run(ctx),
            FrameSource::FrameDirectory(s) => s.run(ctx),
        }
    }
}
