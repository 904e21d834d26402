//! Video file source: paced replay of frames decoded from a single file.
//!
//! Decoding itself is an external collaborator's concern (the original
//! container/codec is opaque to this pipeline); `VideoFile` drives an
//! injected [`VideoDecoder`] and is responsible only for sequencing,
//! timestamp synthesis, and wall-clock pacing.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::{FrameProducer, FrameSourceError, RawFrame, RunContext, SourceMetadata};

/// Abstract decoder capability: yields frames in order, `None` at EOF.
pub trait VideoDecoder: Send {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, FrameSourceError>;
    fn metadata(&self) -> SourceMetadata;
}

pub struct VideoFile {
    decoder: Box<dyn VideoDecoder>,
    sequence: u64,
}

impl VideoFile {
    pub fn new(decoder: Box<dyn VideoDecoder>) -> Self {
        Self {
            decoder,
            sequence: 0,
        }
    }
}

impl FrameProducer for VideoFile {
    fn metadata(&self) -> SourceMetadata {
        self.decoder.metadata()
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), FrameSourceError> {
        let fps = self.decoder.metadata().fps;
        let period = Duration::from_secs_f64(1.0 / fps);
        let start = Utc::now();

        while !ctx.should_stop() {
            let tick = Instant::now();
            match self.decoder.next_frame()? {
                Some(raw) => {
                    ctx.publish(raw, self.sequence, start, fps)?;
                    self.sequence += 1;
                }
                None => break, // EOF
            }
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
    use sky_frame::{PixelBuffer, PixelDepth};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FiniteDecoder {
        remaining: u32,
    }

    impl VideoDecoder for FiniteDecoder {
        fn next_frame(&mut self) -> Result<Option<RawFrame>, FrameSourceError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(RawFrame {
                pixels: PixelBuffer::Eight(Arc::from(vec![0u8; 4])),
                width: 2,
                height: 2,
                timestamp: None,
                gain: 1.0,
                exposure_ms: 1.0,
            }))
        }

        fn metadata(&self) -> SourceMetadata {
            SourceMetadata {
                depth: PixelDepth::Eight,
                width: 2,
                height: 2,
                fps: 500.0,
            }
        }
    }

    #[test]
    fn stops_at_eof() {
        let decoder = FiniteDecoder { remaining: 5 };
        let mut source = VideoFile::new(Box::new(decoder));
        let ring = Arc::new(ring_buffer::RingBuffer::new(10));
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = RunContext {
            ring: ring.clone(),
            stop,
            source_tag: "video".into(),
        };
        source.run(&ctx).unwrap();
        assert_eq!(ring.total_written(), 5);
    }

    #[test]
    fn stop_flag_halts_before_eof() {
        let decoder = FiniteDecoder { remaining: 10_000 };
        let mut source = VideoFile::new(Box::new(decoder));
        let ring = Arc::new(ring_buffer::RingBuffer::new(10));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let ctx = RunContext {
            ring: ring.clone(),
            stop,
            source_tag: "video".into(),
        };
        let handle = std::thread::spawn(move || source.run(&ctx));
        std::thread::sleep(Duration::from_millis(10));
        stop_clone.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
        assert!(ring.total_written() < 10_000);
    }
}
