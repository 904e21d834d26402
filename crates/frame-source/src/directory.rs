//! Frame directory source: paced replay of numbered still-frame files.
//!
//! Files are named `{prefix}{index:0width$}{suffix}` with `index` ascending
//! over `[start, stop]`. Reading a file into pixels is delegated to a
//! [`FrameFileReader`] so the astro-specific container format (the FITS
//! reader is treated as an opaque, out-of-tree persister contract) can be
//! swapped without touching the pacing logic.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sky_frame::{PixelBuffer, PixelDepth};

use crate::{FrameProducer, FrameSourceError, RawFrame, RunContext, SourceMetadata};

/// Reads one frame file from disk into raw pixels.
pub trait FrameFileReader: Send {
    fn read(&self, path: &Path) -> Result<RawFrame, FrameSourceError>;
}

/// Reader backed by the `image` crate: decodes any format it supports into
/// 8-bit luma. Good enough for the common case where frame files are plain
/// raster images; a FITS-aware reader is a drop-in replacement.
pub struct ImageFileReader;

impl FrameFileReader for ImageFileReader {
    fn read(&self, path: &Path) -> Result<RawFrame, FrameSourceError> {
        let img = image::open(path).map_err(|e| FrameSourceError::Decode(e.to_string()))?;
        let luma = img.to_luma8();
        let (width, height) = (luma.width(), luma.height());
        let timestamp = read_sidecar_timestamp(path);
        Ok(RawFrame {
            pixels: PixelBuffer::Eight(std::sync::Arc::from(luma.into_raw())),
            width,
            height,
            timestamp,
            gain: 0.0,
            exposure_ms: 0.0,
        })
    }
}

/// A `.ts` sidecar next to the frame file, if present, holding a UTC RFC3339
/// timestamp; absent sidecars fall back to the synthesized `start + seq/fps`
/// timestamp.
fn read_sidecar_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let sidecar = path.with_extension("ts");
    let text = std::fs::read_to_string(sidecar).ok()?;
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct FrameDirectoryConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub suffix: String,
    pub width_digits: usize,
    pub start: u32,
    pub stop: u32,
    pub fps: f64,
    pub frame_width: u32,
    pub frame_height: u32,
}

pub struct FrameDirectory {
    config: FrameDirectoryConfig,
    reader: Box<dyn FrameFileReader>,
    next_index: u32,
}

impl FrameDirectory {
    pub fn new(config: FrameDirectoryConfig, reader: Box<dyn FrameFileReader>) -> Self {
        let next_index = config.start;
        Self {
            config,
            reader,
            next_index,
        }
    }

    fn path_for(&self, index: u32) -> PathBuf {
        self.config.dir.join(format!(
            "{}{:0width$}{}",
            self.config.prefix,
            index,
            self.config.suffix,
            width = self.config.width_digits
        ))
    }
}

impl FrameProducer for FrameDirectory {
    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            depth: PixelDepth::Eight,
            width: self.config.frame_width,
            height: self.config.frame_height,
            fps: self.config.fps,
        }
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), FrameSourceError> {
        let period = Duration::from_secs_f64(1.0 / self.config.fps);
        let start = Utc::now();

        while self.next_index <= self.config.stop {
            if ctx.should_stop() {
                break;
            }
            let tick = Instant::now();
            let index = self.next_index;
            let path = self.path_for(index);
            let raw = self.reader.read(&path)?;
            // Sequence numbers follow the file's numeric suffix directly,
            // e.g. start=3, stop=7 -> sequences {3..7}.
            ctx.publish(raw, index as u64, start, self.config.fps)?;
            self.next_index += 1;

            let elapsed = tick.elapsed();
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn write_test_png(dir: &Path, name: &str) {
        use image::{GrayImage, Luma};
        let mut img = GrayImage::new(4, 4);
        for p in img.pixels_mut() {
            *p = Luma([42u8]);
        }
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn publishes_sequence_numbers_matching_file_indices() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 1..=10 {
            write_test_png(tmp.path(), &format!("img_{:04}.png", i));
        }

        let config = FrameDirectoryConfig {
            dir: tmp.path().to_path_buf(),
            prefix: "img_".into(),
            suffix: ".png".into(),
            width_digits: 4,
            start: 3,
            stop: 7,
            fps: 1000.0,
            frame_width: 4,
            frame_height: 4,
        };
        let mut source = FrameDirectory::new(config, Box::new(ImageFileReader));

        let ring = Arc::new(ring_buffer::RingBuffer::new(10));
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = RunContext {
            ring: ring.clone(),
            stop,
            source_tag: "dir".into(),
        };

        source.run(&ctx).unwrap();

        let snap = ring.snapshot_range(0, 20);
        let mut seqs: Vec<u64> = snap.frames.iter().map(|f| f.sequence).collect();
        seqs.sort();
        assert_eq!(seqs, vec![3, 4, 5, 6, 7]);
    }
}
