//! Filesystem-backed `StorageSink`/`StackSink` implementations.
//!
//! The daily rollover layout (`${DataPath}/${StationName}_YYYYMMDD/`) is
//! handled by [`layout::DailyLayout`]; this module maps each [`Artifact`]
//! variant and [`StackedFrame`] onto files under that layout. The FITS
//! container format itself stays out of scope: image artifacts are
//! written with the `image` crate and sidecar metadata as JSON, standing
//! in for what an out-of-tree FITS writer would otherwise produce.

mod layout;

pub use layout::DailyLayout;

use std::io;
use std::sync::Arc;

use event_recorder::{Artifact, RecorderError, StorageSink};
use image::{ImageBuffer, Luma};
use stacker::{StackSink, StackedFrame, StackerError};
use tracing::debug;

/// Writes event artifacts under `${DataPath}/${StationName}_YYYYMMDD/eventNNN/`.
pub struct FsStorageSink {
    layout: Arc<DailyLayout>,
}

impl FsStorageSink {
    pub fn new(layout: Arc<DailyLayout>) -> Self {
        Self { layout }
    }
}

impl StorageSink for FsStorageSink {
    fn persist(&self, event_id: u64, artifact: Artifact) -> Result<(), RecorderError> {
        let dir = self
            .layout
            .event_dir(event_id)
            .map_err(|e| RecorderError::Io(e.to_string()))?;

        write_artifact(&dir, artifact).map_err(|e| RecorderError::Io(e.to_string()))
    }
}

fn write_artifact(dir: &std::path::Path, artifact: Artifact) -> io::Result<()> {
    match artifact {
        Artifact::Cube { pages } => {
            // One page per frame, named so lexical order matches acquisition
            // order; a real FITS writer would instead emit a single
            // multi-HDU file from these same pages.
            for (i, frame) in pages.iter().enumerate() {
                let path = dir.join(format!("cube_{i:04}.png"));
                write_gray_image(&path, frame.width, frame.height, &frame.pixels.to_f32_vec())?;
            }
            Ok(())
        }
        Artifact::PeakFrame { frame } => {
            let path = dir.join("peak.png");
            write_gray_image(&path, frame.width, frame.height, &frame.pixels.to_f32_vec())
        }
        Artifact::SummedImage { pixels, width, height } => {
            let path = dir.join("sum.png");
            let samples: Vec<f32> = pixels.iter().map(|&v| v as f32).collect();
            write_gray_image(&path, width, height, &samples)
        }
        Artifact::MaxIntensityProjection { pixels, width, height } => {
            let path = dir.join("gemap.png");
            let samples: Vec<f32> = pixels.iter().map(|&v| v as f32).collect();
            write_gray_image(&path, width, height, &samples)
        }
        Artifact::PositionalText { lines } => {
            let path = dir.join("positions.txt");
            std::fs::write(path, lines.join("\n"))
        }
        Artifact::PreviewBitmap { pixels, width, height } => {
            let path = dir.join("preview.bmp");
            let buffer: ImageBuffer<Luma<u8>, Vec<u8>> =
                ImageBuffer::from_raw(width, height, pixels)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "preview bitmap size mismatch"))?;
            buffer
                .save(&path)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
        }
        Artifact::Metadata(meta) => {
            let path = dir.join("metadata.json");
            let text = serde_json::to_string_pretty(&meta)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            std::fs::write(path, text)
        }
    }
}

fn write_gray_image(path: &std::path::Path, width: u32, height: u32, samples: &[f32]) -> io::Result<()> {
    let max = samples.iter().cloned().fold(1.0f32, f32::max);
    let pixels: Vec<u8> = samples
        .iter()
        .map(|&v| ((v / max) * 255.0).clamp(0.0, 255.0) as u8)
        .collect();
    let buffer: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_raw(width, height, pixels)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "image buffer size mismatch"))?;
    buffer
        .save(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Writes closed stacks under `${DataPath}/${StationName}_YYYYMMDD/stacks/`.
pub struct FsStackSink {
    layout: Arc<DailyLayout>,
}

impl FsStackSink {
    pub fn new(layout: Arc<DailyLayout>) -> Self {
        Self { layout }
    }
}

impl StackSink for FsStackSink {
    fn persist(&self, frame: StackedFrame) -> Result<(), StackerError> {
        let dir = self
            .layout
            .stacks_dir()
            .map_err(|e| StackerError::Persist(e.to_string()))?;

        let stem = frame.start.format("%Y%m%d_%H%M%S").to_string();
        let image_path = dir.join(format!("stack_{stem}.png"));
        let meta_path = dir.join(format!("stack_{stem}.json"));

        let samples: Vec<f32> = frame.pixels.iter().map(|&v| v as f32).collect();
        write_gray_image(&image_path, frame.width, frame.height, &samples)
            .map_err(|e| StackerError::Persist(e.to_string()))?;

        let meta = StackMetaSidecar {
            method: format!("{:?}", frame.method),
            frame_count: frame.frame_count,
            start: frame.start,
            end: frame.end,
            total_exposure_ms: frame.total_exposure_ms,
            bzero_bscale: frame.bzero_bscale,
        };
        let text = serde_json::to_string_pretty(&meta).map_err(|e| StackerError::Persist(e.to_string()))?;
        std::fs::write(meta_path, text).map_err(|e| StackerError::Persist(e.to_string()))?;

        debug!(path = %image_path.display(), "stacked frame persisted to disk");
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct StackMetaSidecar {
    method: String,
    frame_count: u32,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
    total_exposure_ms: f64,
    bzero_bscale: Option<(f64, f64)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stacker::StackMethod;
    use tempfile::tempdir;

    #[test]
    fn stack_sink_writes_image_and_sidecar() {
        let base = tempdir().unwrap();
        let layout = Arc::new(DailyLayout::new(base.path().to_path_buf(), "STATION1".into(), None));
        let sink = FsStackSink::new(layout.clone());

        let frame = StackedFrame {
            pixels: vec![100u16; 16],
            width: 4,
            height: 4,
            method: StackMethod::Sum,
            frame_count: 10,
            start: Utc::now(),
            end: Utc::now(),
            total_exposure_ms: 100.0,
            bzero_bscale: None,
        };

        sink.persist(frame).unwrap();
        let stacks_dir = layout.stacks_dir().unwrap();
        let entries: Vec<_> = std::fs::read_dir(&stacks_dir).unwrap().collect();
        assert_eq!(entries.len(), 2); // image + json sidecar
    }

    #[test]
    fn storage_sink_writes_positional_text() {
        let base = tempdir().unwrap();
        let layout = Arc::new(DailyLayout::new(base.path().to_path_buf(), "STATION1".into(), None));
        let sink = FsStorageSink::new(layout.clone());

        sink.persist(
            0,
            Artifact::PositionalText {
                lines: vec!["0 0.00 0.00".into(), "1 1.00 0.50".into()],
            },
        )
        .unwrap();

        let event_dir = layout.event_dir(0).unwrap();
        let text = std::fs::read_to_string(event_dir.join("positions.txt")).unwrap();
        assert_eq!(text, "0 0.00 0.00\n1 1.00 0.50");
    }

    #[test]
    fn storage_sink_writes_metadata_json() {
        let base = tempdir().unwrap();
        let layout = Arc::new(DailyLayout::new(base.path().to_path_buf(), "STATION1".into(), None));
        let sink = FsStorageSink::new(layout.clone());

        sink.persist(
            1,
            Artifact::Metadata(event_recorder::EventMetadata {
                station_name: "STATION1".into(),
                bit_depth: 8,
                gain: 1.0,
                exposure_ms: 10.0,
                start: Utc::now(),
                end: Utc::now(),
                trajectory: vec![],
                peak_intensity: 50.0,
                truncated: false,
            }),
        )
        .unwrap();

        let event_dir = layout.event_dir(1).unwrap();
        assert!(event_dir.join("metadata.json").exists());
    }
}
