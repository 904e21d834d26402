//! The artifact set an Event expands into once its window is materialized.

use chrono::{DateTime, Utc};
use detector::TrackPoint;
use image::{GrayImage, Luma};
use imageproc::drawing::draw_line_segment_mut;
use sky_frame::Frame;

/// Which artifacts to produce, mirroring the configuration file's per-event
/// toggles (avi / fits3d / fits2d / sum / pos / bmp / gemap). `avi` playback
/// rendering and the FITS container format itself are handled by the
/// storage sink; this crate only decides what data goes into each artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactConfig {
    pub cube: bool,
    pub peak_frame: bool,
    pub summed_image: bool,
    pub max_projection: bool,
    pub positional_text: bool,
    pub preview_bitmap: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            cube: true,
            peak_frame: true,
            summed_image: true,
            max_projection: true,
            positional_text: true,
            preview_bitmap: true,
        }
    }
}

/// Sidecar metadata persisted alongside every event regardless of which
/// image artifacts are enabled.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventMetadata {
    pub station_name: String,
    pub bit_depth: u8,
    pub gain: f32,
    pub exposure_ms: f32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub trajectory: Vec<TrackPoint>,
    pub peak_intensity: f32,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub enum Artifact {
    /// One page per captured frame, in sequence order.
    Cube { pages: Vec<Frame> },
    /// The single frame with the brightest pixel in the window.
    PeakFrame { frame: Frame },
    /// Per-pixel sum across the window, wide enough to never overflow.
    SummedImage {
        pixels: Vec<u32>,
        width: u32,
        height: u32,
    },
    /// Per-pixel maximum across the window.
    MaxIntensityProjection {
        pixels: Vec<u16>,
        width: u32,
        height: u32,
    },
    /// `t dx dy` lines, one per trajectory sample, offsets relative to the
    /// first sample.
    PositionalText { lines: Vec<String> },
    /// Grayscale preview with the trajectory drawn as a bright overlay.
    PreviewBitmap {
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    },
    Metadata(EventMetadata),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Cube { .. } => "cube",
            Artifact::PeakFrame { .. } => "peak_frame",
            Artifact::SummedImage { .. } => "summed_image",
            Artifact::MaxIntensityProjection { .. } => "max_projection",
            Artifact::PositionalText { .. } => "positional_text",
            Artifact::PreviewBitmap { .. } => "preview_bitmap",
            Artifact::Metadata(_) => "metadata",
        }
    }
}

pub fn positional_text(trajectory: &[TrackPoint]) -> Vec<String> {
    let Some(first) = trajectory.first() else {
        return Vec::new();
    };
    trajectory
        .iter()
        .map(|p| format!("{} {:.2} {:.2}", p.sequence, p.x - first.x, p.y - first.y))
        .collect()
}

pub fn summed_image(frames: &[Frame], width: u32, height: u32) -> (Vec<u32>, u32, u32) {
    let mut sums = vec![0u32; (width as usize) * (height as usize)];
    for frame in frames {
        for (acc, sample) in sums.iter_mut().zip(frame.pixels.to_f32_vec()) {
            *acc += sample as u32;
        }
    }
    (sums, width, height)
}

pub fn max_intensity_projection(frames: &[Frame], width: u32, height: u32) -> (Vec<u16>, u32, u32) {
    let mut max = vec![0u16; (width as usize) * (height as usize)];
    for frame in frames {
        for (acc, sample) in max.iter_mut().zip(frame.pixels.to_f32_vec()) {
            let sample = sample as u16;
            if sample > *acc {
                *acc = sample;
            }
        }
    }
    (max, width, height)
}

/// The frame with the single brightest pixel, used both as the "fits2d"
/// artifact and as the base image for the preview bitmap.
pub fn peak_frame(frames: &[Frame]) -> Option<Frame> {
    frames
        .iter()
        .max_by(|a, b| {
            let pa = a.pixels.to_f32_vec().into_iter().fold(0.0f32, f32::max);
            let pb = b.pixels.to_f32_vec().into_iter().fold(0.0f32, f32::max);
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
}

/// Renders `base` to 8-bit grayscale and draws the trajectory over it as a
/// connected bright polyline, one segment per consecutive pair of points.
pub fn preview_bitmap(base: &Frame, trajectory: &[TrackPoint]) -> (Vec<u8>, u32, u32) {
    let depth_max = base.pixels.depth().max_value() as f32;
    let pixels: Vec<u8> = base
        .pixels
        .to_f32_vec()
        .into_iter()
        .map(|v| ((v / depth_max) * 255.0).clamp(0.0, 255.0) as u8)
        .collect();

    let mut image: GrayImage = GrayImage::from_raw(base.width, base.height, pixels)
        .expect("pixel count matches width*height");

    for pair in trajectory.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        draw_line_segment_mut(&mut image, (a.x, a.y), (b.x, b.y), Luma([255u8]));
    }
    if trajectory.len() == 1 {
        let p = trajectory[0];
        draw_line_segment_mut(&mut image, (p.x, p.y), (p.x, p.y), Luma([255u8]));
    }

    let width = image.width();
    let height = image.height();
    (image.into_raw(), width, height)
}
