//! Event window materialization.
//!
//! Runs on its own thread, pulling confirmed [`detector::Event`]s off a
//! channel. Each event's `[window_start_seq, window_end_seq]` is sliced out
//! of the ring buffer and expanded into the configured artifact set, each
//! dispatched independently to a [`StorageSink`]: one artifact's persist
//! failure must not prevent the others from being written, so each is
//! retried up to twice before being logged and skipped.

mod artifact;
mod sink;

pub use artifact::{Artifact, ArtifactConfig, EventMetadata};
pub use sink::{RecorderError, StorageSink};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use detector::Event;
use ring_buffer::RingBuffer;
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct EventRecorderConfig {
    pub station_name: String,
    pub artifacts: ArtifactConfig,
    /// How long to block waiting for the next event before re-checking the
    /// stop flag.
    pub poll_interval: Duration,
    /// Upper bound on how long to wait for the ring buffer to reach
    /// `lastSeen + Post` before materializing anyway. Callers typically set
    /// this to `1.5 * Post` seconds.
    pub max_wait_for_window: Duration,
}

pub struct EventRecorder {
    config: EventRecorderConfig,
    ring: Arc<RingBuffer>,
    stop: Arc<AtomicBool>,
    events: Receiver<Event>,
    sink: Box<dyn StorageSink>,
    next_event_id: u64,
}

impl EventRecorder {
    pub fn new(
        config: EventRecorderConfig,
        ring: Arc<RingBuffer>,
        stop: Arc<AtomicBool>,
        events: Receiver<Event>,
        sink: Box<dyn StorageSink>,
    ) -> Self {
        Self {
            config,
            ring,
            stop,
            events,
            sink,
            next_event_id: 0,
        }
    }

    pub fn run(&mut self) {
        loop {
            match self.events.recv_timeout(self.config.poll_interval) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        let reached_end = self.wait_for_window_end(event.window_end_seq);

        let snapshot = self
            .ring
            .snapshot_range(event.window_start_seq, event.window_end_seq);
        let truncated = event.truncated || snapshot.missed > 0 || !reached_end;

        if snapshot.frames.is_empty() {
            warn!(first = event.first_seen_seq, "event window is empty, nothing to record");
            return;
        }

        let event_id = self.next_event_id;
        self.next_event_id += 1;

        let width = snapshot.frames[0].width;
        let height = snapshot.frames[0].height;
        let artifacts = self.build_artifacts(&snapshot.frames, &event, width, height, truncated);

        info!(
            event_id,
            count = artifacts.len(),
            truncated,
            missed = snapshot.missed,
            "materializing event"
        );

        for artifact in artifacts {
            self.dispatch(event_id, artifact);
        }
    }

    /// Blocks until the ring buffer's latest sequence reaches
    /// `window_end_seq`, or `max_wait_for_window` elapses, or the source
    /// stalls (shutdown requested). Returns whether the window was reached.
    fn wait_for_window_end(&self, window_end_seq: u64) -> bool {
        let deadline = Instant::now() + self.config.max_wait_for_window;
        loop {
            if let Some(latest) = self.ring.latest() {
                if latest.sequence >= window_end_seq {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                warn!(window_end_seq, "timed out waiting for post-trigger window, recording truncated");
                return false;
            }
            if self.stop.load(Ordering::Relaxed) {
                return false;
            }
            thread::sleep(self.config.poll_interval.min(Duration::from_millis(50)));
        }
    }

    fn build_artifacts(
        &self,
        frames: &[sky_frame::Frame],
        event: &Event,
        width: u32,
        height: u32,
        truncated: bool,
    ) -> Vec<Artifact> {
        let cfg = self.config.artifacts;
        let mut out = Vec::new();

        let peak = artifact::peak_frame(frames);

        if cfg.cube {
            out.push(Artifact::Cube {
                pages: frames.to_vec(),
            });
        }
        if cfg.peak_frame {
            if let Some(frame) = peak.clone() {
                out.push(Artifact::PeakFrame { frame });
            }
        }
        if cfg.summed_image {
            let (pixels, w, h) = artifact::summed_image(frames, width, height);
            out.push(Artifact::SummedImage { pixels, width: w, height: h });
        }
        if cfg.max_projection {
            let (pixels, w, h) = artifact::max_intensity_projection(frames, width, height);
            out.push(Artifact::MaxIntensityProjection { pixels, width: w, height: h });
        }
        if cfg.positional_text {
            out.push(Artifact::PositionalText {
                lines: artifact::positional_text(&event.trajectory),
            });
        }
        if cfg.preview_bitmap {
            if let Some(base) = peak {
                let (pixels, w, h) = artifact::preview_bitmap(&base, &event.trajectory);
                out.push(Artifact::PreviewBitmap { pixels, width: w, height: h });
            }
        }

        let first = frames.first();
        let last = frames.last();
        out.push(Artifact::Metadata(EventMetadata {
            station_name: self.config.station_name.clone(),
            bit_depth: match first.map(|f| f.depth()) {
                Some(sky_frame::PixelDepth::Eight) => 8,
                Some(sky_frame::PixelDepth::Sixteen) => 16,
                None => 8,
            },
            gain: first.map(|f| f.gain).unwrap_or_default(),
            exposure_ms: first.map(|f| f.exposure_ms).unwrap_or_default(),
            start: first.map(|f| f.timestamp).unwrap_or_else(chrono::Utc::now),
            end: last.map(|f| f.timestamp).unwrap_or_else(chrono::Utc::now),
            trajectory: event.trajectory.clone(),
            peak_intensity: event.peak_intensity,
            truncated,
        }));

        out
    }

    fn dispatch(&self, event_id: u64, artifact: Artifact) {
        let kind = artifact.kind();
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.sink.persist(event_id, artifact.clone()) {
                Ok(()) => return,
                Err(e) => {
                    warn!(event_id, kind, attempt, error = %e, "artifact persist failed");
                    last_err = Some(e);
                }
            }
        }

        error!(event_id, kind, error = ?last_err, "artifact persist exhausted retries, skipping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use detector::TrackPoint;
    use sky_frame::PixelBuffer;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn frame(value: u8, seq: u64) -> sky_frame::Frame {
        let data: Arc<[u8]> = Arc::from(vec![value; 4]);
        sky_frame::Frame::new(PixelBuffer::Eight(data), 2, 2, Utc::now(), seq, 1.0, 10.0, "t").unwrap()
    }

    struct CountingSink {
        calls: Arc<Mutex<Vec<(u64, &'static str)>>>,
        fail_kinds: Vec<&'static str>,
    }

    impl StorageSink for CountingSink {
        fn persist(&self, event_id: u64, artifact: Artifact) -> Result<(), RecorderError> {
            let kind = artifact.kind();
            self.calls.lock().unwrap().push((event_id, kind));
            if self.fail_kinds.contains(&kind) {
                Err(RecorderError::Io("simulated failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn materializes_all_configured_artifacts_for_one_event() {
        let ring = Arc::new(RingBuffer::new(50));
        for seq in 0..20u64 {
            ring.push(frame(if seq == 10 { 200 } else { 30 }, seq));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = CountingSink {
            calls: calls.clone(),
            fail_kinds: Vec::new(),
        };

        let config = EventRecorderConfig {
            station_name: "TESTSTATION".into(),
            artifacts: ArtifactConfig::default(),
            poll_interval: Duration::from_millis(10),
            max_wait_for_window: Duration::from_millis(5),
        };

        let stop_clone = stop.clone();
        let ring_clone = ring.clone();
        let handle = thread::spawn(move || {
            let mut recorder = EventRecorder::new(config, ring_clone, stop_clone, rx, Box::new(sink));
            recorder.run();
        });

        tx.send(Event {
            trajectory: vec![
                TrackPoint { sequence: 8, x: 0.0, y: 0.0 },
                TrackPoint { sequence: 10, x: 1.0, y: 1.0 },
                TrackPoint { sequence: 12, x: 2.0, y: 2.0 },
            ],
            peak_intensity: 200.0,
            first_seen_seq: 8,
            last_seen_seq: 12,
            window_start_seq: 5,
            window_end_seq: 15,
            truncated: false,
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        stop.store(true, Ordering::SeqCst);
        drop(tx);
        handle.join().unwrap();

        let recorded = calls.lock().unwrap();
        let kinds: Vec<&str> = recorded.iter().map(|(_, k)| *k).collect();
        assert!(kinds.contains(&"cube"));
        assert!(kinds.contains(&"peak_frame"));
        assert!(kinds.contains(&"summed_image"));
        assert!(kinds.contains(&"max_projection"));
        assert!(kinds.contains(&"positional_text"));
        assert!(kinds.contains(&"preview_bitmap"));
        assert!(kinds.contains(&"metadata"));
    }

    #[test]
    fn failing_artifact_is_retried_then_skipped_without_blocking_others() {
        let ring = Arc::new(RingBuffer::new(20));
        for seq in 0..5u64 {
            ring.push(frame(50, seq));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = CountingSink {
            calls: calls.clone(),
            fail_kinds: vec!["cube"],
        };

        let config = EventRecorderConfig {
            station_name: "TESTSTATION".into(),
            artifacts: ArtifactConfig::default(),
            poll_interval: Duration::from_millis(10),
            max_wait_for_window: Duration::from_millis(5),
        };

        let stop_clone = stop.clone();
        let handle = thread::spawn(move || {
            let mut recorder = EventRecorder::new(config, ring, stop_clone, rx, Box::new(sink));
            recorder.run();
        });

        tx.send(Event {
            trajectory: vec![TrackPoint { sequence: 2, x: 0.0, y: 0.0 }],
            peak_intensity: 50.0,
            first_seen_seq: 2,
            last_seen_seq: 2,
            window_start_seq: 0,
            window_end_seq: 4,
            truncated: false,
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        stop.store(true, Ordering::SeqCst);
        drop(tx);
        handle.join().unwrap();

        let recorded = calls.lock().unwrap();
        let cube_attempts = recorded.iter().filter(|(_, k)| *k == "cube").count();
        assert_eq!(cube_attempts, 3);
        assert!(recorded.iter().any(|(_, k)| *k == "metadata"));
    }
}
