//! Live camera source.
//!
//! The vendor SDK itself is out of scope for this pipeline: a real adapter
//! (Basler Pylon, ToupTek, DMK) implements [`CameraDevice`] out-of-tree and
//! is handed in by dependency injection. `LiveCamera` only knows the
//! capability contract: open, grab, close, metadata.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tracing::{error, warn};

use crate::{FrameProducer, FrameSourceError, RawFrame, RunContext, SourceMetadata};

/// Desired acquisition parameters applied at `open()`.
#[derive(Debug, Clone, Copy)]
pub struct CameraSettings {
    pub gain: f32,
    pub exposure_ms: f32,
    pub fps: f64,
}

/// Abstract capability contract for a camera vendor SDK.
pub trait CameraDevice: Send {
    fn open(&mut self, settings: CameraSettings) -> Result<(), FrameSourceError>;
    /// Blocking grab of the next frame. `Err(FrameSourceError::Transient)`
    /// is retried by the caller; `Err(FrameSourceError::Disconnected)` is
    /// fatal and surfaces to the Supervisor.
    fn grab(&mut self) -> Result<RawFrame, FrameSourceError>;
    fn close(&mut self);
    fn metadata(&self) -> SourceMetadata;
}

/// Live camera frame source, driving an injected [`CameraDevice`].
pub struct LiveCamera {
    device: Box<dyn CameraDevice>,
    settings: CameraSettings,
    sequence: u64,
    /// Set when the device reports an unrecoverable disconnect; polled by
    /// the Supervisor to decide whether this source's failure is fatal.
    failed: Arc<AtomicBool>,
}

impl LiveCamera {
    pub fn new(device: Box<dyn CameraDevice>, settings: CameraSettings) -> Self {
        Self {
            device,
            settings,
            sequence: 0,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag the Supervisor can poll without owning the source.
    pub fn failure_flag(&self) -> Arc<AtomicBool> {
        self.failed.clone()
    }
}

impl FrameProducer for LiveCamera {
    fn metadata(&self) -> SourceMetadata {
        self.device.metadata()
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), FrameSourceError> {
        self.device.open(self.settings)?;
        let fps = self.settings.fps;
        let start = Utc::now();
        let frame_period = self.device.metadata().frame_period();

        while !ctx.should_stop() {
            match self.device.grab() {
                Ok(raw) => {
                    ctx.publish(raw, self.sequence, start, fps)?;
                    self.sequence += 1;
                }
                Err(FrameSourceError::Transient(msg)) => {
                    warn!(error = %msg, "transient camera grab failure, retrying");
                    thread::sleep(frame_period);
                }
                Err(FrameSourceError::Disconnected) => {
                    error!("camera disconnected, stopping live source");
                    self.failed.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.device.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sky_frame::{PixelBuffer, PixelDepth};
    use std::sync::Mutex;

    struct FakeDevice {
        fail_after: Option<u64>,
        produced: Mutex<u64>,
    }

    impl CameraDevice for FakeDevice {
        fn open(&mut self, _settings: CameraSettings) -> Result<(), FrameSourceError> {
            Ok(())
        }

        fn grab(&mut self) -> Result<RawFrame, FrameSourceError> {
            let mut produced = self.produced.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if *produced >= limit {
                    return Err(FrameSourceError::Disconnected);
                }
            }
            *produced += 1;
            Ok(RawFrame {
                pixels: PixelBuffer::Eight(std::sync::Arc::from(vec![0u8; 4])),
                width: 2,
                height: 2,
                timestamp: None,
                gain: 1.0,
                exposure_ms: 1.0,
            })
        }

        fn close(&mut self) {}

        fn metadata(&self) -> SourceMetadata {
            SourceMetadata {
                depth: PixelDepth::Eight,
                width: 2,
                height: 2,
                fps: 1000.0,
            }
        }
    }

    #[test]
    fn disconnect_sets_failure_flag_and_returns() {
        let device = FakeDevice {
            fail_after: Some(3),
            produced: Mutex::new(0),
        };
        let settings = CameraSettings {
            gain: 1.0,
            exposure_ms: 1.0,
            fps: 1000.0,
        };
        let mut camera = LiveCamera::new(Box::new(device), settings);
        let failed = camera.failure_flag();

        let ring = Arc::new(ring_buffer::RingBuffer::new(10));
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = RunContext {
            ring,
            stop,
            source_tag: "test".into(),
        };

        camera.run(&ctx).unwrap();
        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(ctx.ring.total_written(), 3);
    }

    #[test]
    fn stop_flag_halts_loop() {
        let device = FakeDevice {
            fail_after: None,
            produced: Mutex::new(0),
        };
        let settings = CameraSettings {
            gain: 1.0,
            exposure_ms: 1.0,
            fps: 1000.0,
        };
        let mut camera = LiveCamera::new(Box::new(device), settings);

        let ring = Arc::new(ring_buffer::RingBuffer::new(10));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let ctx = RunContext {
            ring: ring.clone(),
            stop,
            source_tag: "test".into(),
        };

        let handle = thread::spawn(move || camera.run(&ctx));
        thread::sleep(std::time::Duration::from_millis(5));
        stop_clone.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
        assert!(ring.total_written() > 0);
    }
}
