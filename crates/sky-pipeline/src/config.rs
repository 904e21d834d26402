//! Configuration loading and validation.
//!
//! Parsing the vendor `key = value` `.cfg` grammar itself is out of scope;
//! this loader accepts TOML/JSON/YAML via the `config` crate (layered:
//! file, then `SKY__`-prefixed environment overrides), covering every
//! camera/mask/stack/detection/output key under typed, `kebab-case`
//! sections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: config::ConfigError,
    },
    #[error("contradictory configuration: {0}")]
    Contradictory(String),
    #[error("unsupported detection method '{0}', only 'connected-component' is wired")]
    UnsupportedDetMethod(String),
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CameraType {
    Basler,
    Dmk,
    Video,
    Frames,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    pub camera_type: CameraType,
    pub camera_name: String,
    pub exposure_ms: f32,
    pub gain: f32,
    /// 8 or 12; a 12-bit sensor is still carried in a 16-bit `PixelBuffer`.
    pub bit_depth: u8,
    pub fps: f64,
    pub acquisition_buffer_seconds: u32,
    pub video_path: Option<PathBuf>,
    pub frames_dir: Option<PathBuf>,
    pub frames_prefix: Option<String>,
    pub frames_suffix: Option<String>,
    pub frames_width_digits: Option<usize>,
    pub frames_start: Option<u32>,
    pub frames_stop: Option<u32>,
    pub frame_width: u32,
    pub frame_height: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MaskConfig {
    pub mask_enabled: bool,
    pub mask_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StackConfig {
    pub stack_enabled: bool,
    /// Number of frames folded into each stack.
    pub stack_frames: u32,
    /// Seconds between window opens.
    pub stack_interval_seconds: u64,
    pub stack_method: String,
    /// `FIXED` or `BZERO_BSCALE`.
    pub stack_reduction: String,
    pub stack_reduction_divisor: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetectionConfig {
    pub detection_enabled: bool,
    pub det_method: String,
    /// Seconds of ring-buffer context before the first detection (`Pre`).
    pub det_time_before: u64,
    /// Seconds of ring-buffer context after the last detection (`Post`).
    pub det_time_after: u64,
    /// Maximum concurrent open candidates (`DetGeMax`).
    pub det_ge_max: usize,
    /// Maximum candidate age / event rate window, in seconds (`DetTimeMax`).
    pub det_time_max: u64,
    pub det_downsample: bool,
    pub det_avi: bool,
    pub det_fits3d: bool,
    pub det_fits2d: bool,
    pub det_sum: bool,
    pub det_pos: bool,
    pub det_bmp: bool,
    pub det_gemap: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    pub data_path: PathBuf,
    pub station_name: String,
    pub longitude: f64,
    pub latitude: f64,
    pub log_path: PathBuf,
    pub file_copy_on_rollover: bool,
    pub debug_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub camera: CameraConfig,
    pub mask: MaskConfig,
    pub stack: StackConfig,
    pub detection: DetectionConfig,
    pub output: OutputConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SKY").separator("__"))
            .build()
            .map_err(|source| ConfigError::Load {
                path: path.display().to_string(),
                source,
            })?;

        let parsed: PipelineConfig = built.try_deserialize().map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.detection.det_method != "connected-component" {
            return Err(ConfigError::UnsupportedDetMethod(self.detection.det_method.clone()));
        }
        match self.camera.camera_type {
            CameraType::Video if self.camera.video_path.is_none() => {
                return Err(ConfigError::Contradictory(
                    "camera-type = VIDEO requires video-path".into(),
                ));
            }
            CameraType::Frames
                if self.camera.frames_dir.is_none()
                    || self.camera.frames_start.is_none()
                    || self.camera.frames_stop.is_none() =>
            {
                return Err(ConfigError::Contradictory(
                    "camera-type = FRAMES requires frames-dir, frames-start, frames-stop".into(),
                ));
            }
            _ => {}
        }
        if self.stack.stack_enabled && self.stack.stack_frames == 0 {
            return Err(ConfigError::Contradictory("stack-frames must be > 0 when stacking is enabled".into()));
        }
        Ok(())
    }

    pub fn detector_config(&self) -> detector::DetectorConfig {
        let fps = self.camera.fps.max(1.0);
        let mut config = detector::DetectorConfig::default();
        config.pre_trigger_frames = (self.detection.det_time_before as f64 * fps).round() as u64;
        config.post_trigger_frames = (self.detection.det_time_after as f64 * fps).round() as u64;
        config.max_open_candidates = self.detection.det_ge_max;
        config.rate_window = Duration::from_secs(self.detection.det_time_max.max(1));
        config.downsample = self.detection.det_downsample;
        config
    }

    pub fn stacker_config(&self) -> stacker::StackerConfig {
        let method = match self.stack.stack_method.to_ascii_uppercase().as_str() {
            "MEAN" => stacker::StackMethod::Mean,
            "MAX" => stacker::StackMethod::Max,
            _ => stacker::StackMethod::Sum,
        };
        let reduction = match self.stack.stack_reduction.to_ascii_uppercase().as_str() {
            "BZERO_BSCALE" => stacker::ReductionMethod::BzeroBscale,
            _ => stacker::ReductionMethod::FixedShift {
                divisor: self.stack.stack_reduction_divisor.max(1),
            },
        };
        stacker::StackerConfig {
            stack_interval: Duration::from_secs(self.stack.stack_interval_seconds.max(1)),
            stack_frames: self.stack.stack_frames,
            method,
            reduction,
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn event_recorder_config(&self) -> event_recorder::EventRecorderConfig {
        event_recorder::EventRecorderConfig {
            station_name: self.output.station_name.clone(),
            artifacts: event_recorder::ArtifactConfig {
                cube: self.detection.det_fits3d,
                peak_frame: self.detection.det_fits2d,
                summed_image: self.detection.det_sum,
                max_projection: self.detection.det_gemap,
                positional_text: self.detection.det_pos,
                preview_bitmap: self.detection.det_bmp,
            },
            poll_interval: Duration::from_millis(200),
            max_wait_for_window: Duration::from_secs_f64(1.5 * self.detection.det_time_after as f64),
        }
    }

    pub fn ring_buffer_capacity(&self) -> usize {
        ((self.camera.acquisition_buffer_seconds as f64) * self.camera.fps).round().max(1.0) as usize
    }
}
