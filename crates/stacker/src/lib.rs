//! Periodic stacking accumulator.
//!
//! Runs on its own thread, waking on the ring buffer's stacker condition
//! variable. A stack window opens every `stack_interval`, folds frames into
//! an [`Accumulator`] until `stack_frames` have been consumed, then closes
//! and dispatches a [`StackedFrame`] to a [`StackSink`]. A persist failure
//! is logged and does not stop the thread.

mod accumulator;

pub use accumulator::{Accumulator, ReductionMethod, StackMethod, StackedFrame};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ring_buffer::RingBuffer;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StackerError {
    #[error("persist failed: {0}")]
    Persist(String),
}

/// External collaborator the Stacker hands closed stacks to.
pub trait StackSink: Send {
    fn persist(&self, frame: StackedFrame) -> Result<(), StackerError>;
}

#[derive(Debug, Clone)]
pub struct StackerConfig {
    pub stack_interval: Duration,
    pub stack_frames: u32,
    pub method: StackMethod,
    pub reduction: ReductionMethod,
    /// How long to block on the condvar before re-checking wall clock and
    /// the stop flag; keeps window-open timing responsive even if the
    /// frame stream is momentarily idle.
    pub poll_interval: Duration,
}

impl Default for StackerConfig {
    fn default() -> Self {
        Self {
            stack_interval: Duration::from_secs(60),
            stack_frames: 300,
            method: StackMethod::Sum,
            reduction: ReductionMethod::FixedShift { divisor: 1 },
            poll_interval: Duration::from_millis(200),
        }
    }
}

pub struct Stacker {
    config: StackerConfig,
    ring: Arc<RingBuffer>,
    stop: Arc<AtomicBool>,
    sink: Box<dyn StackSink>,
}

impl Stacker {
    pub fn new(config: StackerConfig, ring: Arc<RingBuffer>, stop: Arc<AtomicBool>, sink: Box<dyn StackSink>) -> Self {
        Self {
            config,
            ring,
            stop,
            sink,
        }
    }

    /// Run the stacker loop until the stop flag is observed.
    pub fn run(&mut self) {
        let mut last_seq_processed: Option<u64> = None;
        let mut generation = self.ring.current_generation();
        let mut accumulator: Option<Accumulator> = None;
        let mut window_opens_at = Instant::now();

        while !self.stop.load(Ordering::Relaxed) {
            generation = self.ring.wait_for_stacker(generation, self.config.poll_interval);

            let Some(latest) = self.ring.latest() else {
                continue;
            };
            let start_seq = last_seq_processed.map(|s| s + 1).unwrap_or(latest.sequence);
            if start_seq > latest.sequence {
                continue;
            }
            let snap = self.ring.snapshot_range(start_seq, latest.sequence);
            last_seq_processed = Some(latest.sequence);

            for frame in &snap.frames {
                if accumulator.is_none() {
                    if Instant::now() < window_opens_at {
                        continue;
                    }
                    debug!(width = frame.width, height = frame.height, "opening stack window");
                    accumulator = Some(Accumulator::open(frame.width, frame.height, self.config.method));
                }

                if let Some(acc) = accumulator.as_mut() {
                    acc.fold(frame);
                    if acc.count() >= self.config.stack_frames {
                        self.close_and_emit(accumulator.take().unwrap());
                        window_opens_at = Instant::now() + self.config.stack_interval;
                    }
                }
            }
        }

        // Flush a partial stack on shutdown if it is at least half full,
        // mirroring the Supervisor's shutdown-order policy for the Stacker.
        if let Some(acc) = accumulator.take() {
            if acc.count() >= self.config.stack_frames / 2 {
                self.close_and_emit(acc);
            } else {
                info!(count = acc.count(), "discarding partial stack below flush threshold");
            }
        }
    }

    fn close_and_emit(&self, acc: Accumulator) {
        let stacked = acc.close(self.config.reduction);
        let n = stacked.frame_count;
        match self.sink.persist(stacked) {
            Ok(()) => info!(frames = n, "stacked frame persisted"),
            Err(e) => warn!(error = %e, "stack persist failed, continuing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sky_frame::{Frame, PixelBuffer};
    use std::sync::{Arc, Mutex};
    use std::thread;

    struct RecordingSink {
        frames: Arc<Mutex<Vec<StackedFrame>>>,
    }

    impl StackSink for RecordingSink {
        fn persist(&self, frame: StackedFrame) -> Result<(), StackerError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn uniform_frame(value: u8, seq: u64) -> Frame {
        let data: Arc<[u8]> = Arc::from(vec![value; 4]);
        Frame::new(PixelBuffer::Eight(data), 2, 2, Utc::now(), seq, 1.0, 10.0, "t").unwrap()
    }

    #[test]
    fn emits_one_stack_per_stack_frames_worth_of_input() {
        let ring = Arc::new(RingBuffer::new(100));
        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            frames: frames.clone(),
        };

        let config = StackerConfig {
            stack_interval: Duration::from_millis(0),
            stack_frames: 10,
            method: StackMethod::Sum,
            reduction: ReductionMethod::FixedShift { divisor: 1 },
            poll_interval: Duration::from_millis(20),
        };

        let ring_for_stacker = ring.clone();
        let stop_for_stacker = stop.clone();
        let handle = thread::spawn(move || {
            let mut stacker = Stacker::new(config, ring_for_stacker, stop_for_stacker, Box::new(sink));
            stacker.run();
        });

        for i in 0..30u64 {
            ring.push(uniform_frame(100, i));
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::SeqCst);
        ring.wake_all();
        handle.join().unwrap();

        let emitted = frames.lock().unwrap();
        assert_eq!(emitted.len(), 3);
        assert!(emitted.iter().all(|f| f.frame_count == 10));
    }
}
