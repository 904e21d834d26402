//! Background subtraction, candidate tracking, and event trigger state
//! machine.
//!
//! Runs on its own thread, waking on the ring buffer's detector condition
//! variable. Each new frame is background-subtracted, thresholded into a
//! binary mask, cleaned up morphologically, and reduced to connected
//! components. Components are associated with open [`Candidate`]s by
//! nearest-neighbor; unmatched components start new candidates, and
//! candidates with no match for too long are abandoned. A candidate whose
//! trajectory and displacement clear the confirmation thresholds is
//! promoted to an [`Event`] and handed off to the event recorder.

pub mod background;
pub mod candidate;
pub mod morphology;

pub use background::BackgroundModel;
pub use candidate::{Candidate, TrackPoint};
pub use morphology::{dilate, erode, label_components, BinaryMask, Component};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use ring_buffer::RingBuffer;
use sky_frame::{Frame, Mask};
use tracing::{debug, info, warn};

/// A confirmed meteor-like event, carrying the ring-buffer sequence window
/// the event recorder should materialize artifacts from.
#[derive(Debug, Clone)]
pub struct Event {
    pub trajectory: Vec<TrackPoint>,
    pub peak_intensity: f32,
    pub first_seen_seq: u64,
    pub last_seen_seq: u64,
    /// Inclusive sequence range the recorder should pull from the ring
    /// buffer: `[first_seen_seq - pre_trigger, last_seen_seq + post_trigger]`.
    pub window_start_seq: u64,
    pub window_end_seq: u64,
    /// Set when the ring buffer could not supply the full pre-trigger
    /// window (it had already overwritten those frames).
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Number of frames used to train the initial background model before
    /// any detection is attempted.
    pub warmup_frames: u32,
    /// Exponential decay rate for the rolling background model.
    pub background_alpha: f32,
    /// A pixel is foreground if it deviates from the background mean by
    /// more than `k_sigma` standard deviations.
    pub k_sigma: f32,
    /// Components smaller than this many pixels are discarded as noise.
    pub min_area: u32,
    /// Components with a lower bounding-box fill ratio than this are
    /// discarded (rejects diffuse noise clusters, keeps compact/streak blobs).
    pub min_fill_ratio: f32,
    /// Maximum centroid distance, in pixels, for associating a component
    /// with an existing candidate between consecutive frames.
    pub max_link_distance: f32,
    /// Consecutive missed frames tolerated before a candidate is abandoned.
    pub gap_tolerance: u32,
    /// Minimum number of trajectory points to confirm a candidate as an event.
    pub min_trajectory_length: usize,
    /// Minimum total centroid displacement, in pixels, to confirm an event.
    pub min_displacement: f32,
    /// Maximum fraction of `min_displacement` a trajectory segment may move
    /// backward along the overall motion direction before the candidate is
    /// treated as non-monotonic (jitter or an out-and-back blob).
    pub reversal_tolerance: f32,
    /// Minimum cosine between a candidate's most recent segment and a new
    /// match's direction, required once the candidate's age reaches 2.
    /// Candidates with no established direction yet always pass.
    pub min_direction_cosine: f32,
    /// Frames of ring-buffer history to include before the first detection.
    pub pre_trigger_frames: u64,
    /// Frames of ring-buffer history to include after the last detection.
    pub post_trigger_frames: u64,
    /// Maximum number of candidates open at once (DetGeMax). Once reached,
    /// a new unmatched component only starts a candidate if it is brighter
    /// than the weakest open candidate, which is evicted to make room.
    pub max_open_candidates: usize,
    /// Maximum confirmed events per `rate_window` (DetTimeMax); additional
    /// confirmations within the window are logged and dropped.
    pub max_events_per_window: u32,
    pub rate_window: Duration,
    pub poll_interval: Duration,
    /// Halve the effective sampling resolution during thresholding (every
    /// other row and column) to cut per-frame CPU cost.
    pub downsample: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            warmup_frames: 30,
            background_alpha: 0.05,
            k_sigma: 5.0,
            min_area: 2,
            min_fill_ratio: 0.2,
            max_link_distance: 15.0,
            gap_tolerance: 2,
            min_trajectory_length: 3,
            min_displacement: 3.0,
            reversal_tolerance: 1.0,
            min_direction_cosine: 0.0,
            pre_trigger_frames: 50,
            post_trigger_frames: 50,
            max_open_candidates: 32,
            // At most one confirmed Event per rate_window (DetTimeMax).
            max_events_per_window: 1,
            rate_window: Duration::from_secs(60),
            poll_interval: Duration::from_millis(200),
            downsample: false,
        }
    }
}

pub struct Detector {
    config: DetectorConfig,
    ring: Arc<RingBuffer>,
    stop: Arc<AtomicBool>,
    events: Sender<Event>,
    mask: Option<Mask>,
    background: Option<BackgroundModel>,
    candidates: Vec<Candidate>,
    events_this_window: u32,
    window_started: Option<std::time::Instant>,
}

impl Detector {
    pub fn new(
        config: DetectorConfig,
        ring: Arc<RingBuffer>,
        stop: Arc<AtomicBool>,
        events: Sender<Event>,
    ) -> Self {
        Self::with_mask(config, ring, stop, events, None)
    }

    /// `mask`, where present, gates the foreground test: pixels where the
    /// mask is disabled are forced to background regardless of measurement
    /// (horizon obstructions, fixed artifacts). A frame-sized all-enabled
    /// mask is assumed when `None`.
    pub fn with_mask(
        config: DetectorConfig,
        ring: Arc<RingBuffer>,
        stop: Arc<AtomicBool>,
        events: Sender<Event>,
        mask: Option<Mask>,
    ) -> Self {
        Self {
            config,
            ring,
            stop,
            events,
            mask,
            background: None,
            candidates: Vec::new(),
            events_this_window: 0,
            window_started: None,
        }
    }

    pub fn run(&mut self) {
        let mut generation = self.ring.current_generation();
        let mut last_seq_processed: Option<u64> = None;

        while !self.stop.load(Ordering::Relaxed) {
            generation = self.ring.wait_for_detector(generation, self.config.poll_interval);

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
                self.process_frame(frame);
            }
        }

        // Close out any candidate still open at shutdown as a truncated event.
        let open: Vec<Candidate> = std::mem::take(&mut self.candidates);
        for candidate in open {
            if candidate.is_confirmable(
                self.config.min_trajectory_length,
                self.config.min_displacement,
                self.config.reversal_tolerance,
            ) {
                self.confirm(candidate, true);
            }
        }
    }

    fn process_frame(&mut self, frame: &Frame) {
        let samples = frame.pixels.to_f32_vec();

        let background = self.background.get_or_insert_with(|| {
            BackgroundModel::new(frame.width, frame.height, self.config.background_alpha, self.config.warmup_frames)
        });

        if background.is_warming_up() {
            background.observe_warmup(&samples);
            return;
        }

        let mask = self.threshold(frame, &samples);
        let cleaned = erode(&dilate(&mask));
        let components: Vec<Component> = label_components(&cleaned)
            .into_iter()
            .filter(|c| c.area >= self.config.min_area && c.fill_ratio() >= self.config.min_fill_ratio)
            .collect();

        self.associate(&components, frame, &samples);

        let exclusions: Vec<_> = self.candidates.iter().map(|c| c.exclusion_box()).collect();
        self.background
            .as_mut()
            .expect("populated above")
            .observe(&samples, &exclusions);
    }

    /// Foreground test against the rolling background model. When
    /// `downsample` is set, only every other row and column is sampled,
    /// halving the per-frame pixel comparisons; `dilate` afterward still
    /// grows the sparser hits back into solid components.
    fn threshold(&self, frame: &Frame, samples: &[f32]) -> BinaryMask {
        let background = self.background.as_ref().expect("trained before threshold");
        let mut foreground = BinaryMask::new(frame.width, frame.height);
        let stride = if self.config.downsample { 2 } else { 1 };
        let mut y = 0;
        while y < frame.height {
            let mut x = 0;
            while x < frame.width {
                if let Some(mask) = &self.mask {
                    if !mask.is_enabled(x, y) {
                        x += stride;
                        continue;
                    }
                }
                let idx = (y * frame.width + x) as usize;
                let mean = background.mean_at(x, y);
                let sigma = background.std_dev_at(x, y).max(1e-3);
                if (samples[idx] - mean).abs() > self.config.k_sigma * sigma {
                    foreground.set(x, y, true);
                }
                x += stride;
            }
            y += stride;
        }
        foreground
    }

    /// Greedy nearest-neighbor association of this frame's components
    /// against open candidates, then lifecycle bookkeeping: extend matches,
    /// mark misses, abandon stale candidates, start new ones, and confirm
    /// any candidate that now clears the promotion thresholds.
    fn associate(&mut self, components: &[Component], frame: &Frame, samples: &[f32]) {
        let mut unmatched: Vec<bool> = vec![true; components.len()];

        for candidate in self.candidates.iter_mut() {
            let last = candidate.last_point();
            let age = candidate.age();
            // A candidate that has moved for a while is allowed to search
            // farther (its own speed may exceed max_link_distance), but
            // only in the direction it has already been moving.
            let max_distance = if age >= 2 {
                self.config.max_link_distance * (age as f32).sqrt()
            } else {
                self.config.max_link_distance
            };
            let mut best: Option<(usize, f32)> = None;
            for (i, component) in components.iter().enumerate() {
                if !unmatched[i] {
                    continue;
                }
                let dx = component.centroid_x - last.x;
                let dy = component.centroid_y - last.y;
                let dist = (dx * dx + dy * dy).sqrt();
                if dist > max_distance {
                    continue;
                }
                if age >= 2
                    && !candidate.is_consistent_direction(
                        component.centroid_x,
                        component.centroid_y,
                        self.config.min_direction_cosine,
                    )
                {
                    continue;
                }
                if best.map(|(_, d)| dist < d).unwrap_or(true) {
                    best = Some((i, dist));
                }
            }

            match best {
                Some((i, _)) => {
                    unmatched[i] = false;
                    let intensity = peak_intensity_of(components[i].clone(), frame, samples);
                    candidate.extend(&components[i], frame.sequence, intensity);
                }
                None => candidate.mark_missed(),
            }
        }

        // A candidate is only finalized (confirmed or discarded) once it
        // stops being tracked; this keeps a single still-moving blob as one
        // candidate for its whole life instead of splitting it into several
        // short-lived ones the moment it first clears the thresholds.
        let gap_tolerance = self.config.gap_tolerance;
        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.candidates.len() {
            if self.candidates[i].should_abandon(gap_tolerance) {
                finished.push(self.candidates.remove(i));
            } else {
                i += 1;
            }
        }

        for candidate in finished {
            if candidate.is_confirmable(
                self.config.min_trajectory_length,
                self.config.min_displacement,
                self.config.reversal_tolerance,
            ) {
                self.confirm(candidate, false);
            } else {
                debug!(first = candidate.first_seen_seq, "discarding unconfirmed candidate");
            }
        }

        for (i, component) in components.iter().enumerate() {
            if !unmatched[i] {
                continue;
            }
            let intensity = peak_intensity_of(component.clone(), frame, samples);
            if self.candidates.len() >= self.config.max_open_candidates {
                let weakest = self
                    .candidates
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.peak_intensity.partial_cmp(&b.1.peak_intensity).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(idx, c)| (idx, c.peak_intensity));
                let Some((weakest_idx, weakest_intensity)) = weakest else {
                    continue;
                };
                if weakest_intensity >= intensity {
                    debug!(intensity, "open-candidate cap reached, discarding weaker detection");
                    continue;
                }
                let evicted = self.candidates.remove(weakest_idx);
                debug!(
                    first = evicted.first_seen_seq,
                    peak = evicted.peak_intensity,
                    "evicting weakest open candidate to admit a stronger detection"
                );
            }
            self.candidates.push(Candidate::start(component, frame.sequence, intensity));
        }
    }

    fn confirm(&mut self, candidate: Candidate, truncated_at_shutdown: bool) {
        self.refresh_rate_window();
        if self.events_this_window >= self.config.max_events_per_window {
            warn!(
                first = candidate.first_seen_seq,
                "dropping confirmed event, rate window exhausted"
            );
            return;
        }
        self.events_this_window += 1;

        let window_start_seq = candidate
            .first_seen_seq
            .saturating_sub(self.config.pre_trigger_frames);
        let window_end_seq = candidate.last_seen_seq + self.config.post_trigger_frames;
        let truncated = truncated_at_shutdown || window_start_seq == 0;

        let event = Event {
            trajectory: candidate.trajectory.clone(),
            peak_intensity: candidate.peak_intensity,
            first_seen_seq: candidate.first_seen_seq,
            last_seen_seq: candidate.last_seen_seq,
            window_start_seq,
            window_end_seq,
            truncated,
        };

        info!(
            first = event.first_seen_seq,
            last = event.last_seen_seq,
            points = event.trajectory.len(),
            "event confirmed"
        );

        if self.events.send(event).is_err() {
            warn!("event recorder channel closed, dropping confirmed event");
        }
    }

    fn refresh_rate_window(&mut self) {
        let now = std::time::Instant::now();
        match self.window_started {
            Some(start) if now.duration_since(start) < self.config.rate_window => {}
            _ => {
                self.window_started = Some(now);
                self.events_this_window = 0;
            }
        }
    }
}

fn peak_intensity_of(component: Component, frame: &Frame, samples: &[f32]) -> f32 {
    let mut peak = 0.0f32;
    for y in component.y0..=component.y1 {
        for x in component.x0..=component.x1 {
            let idx = (y * frame.width + x) as usize;
            if let Some(&v) = samples.get(idx) {
                peak = peak.max(v);
            }
        }
    }
    peak
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sky_frame::PixelBuffer;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration as StdDuration;

    const W: u32 = 16;
    const H: u32 = 16;

    fn frame_with_blob(seq: u64, cx: u32, cy: u32) -> Frame {
        let mut data = vec![20u8; (W * H) as usize];
        for dy in 0..2i64 {
            for dx in 0..2i64 {
                let x = cx as i64 + dx;
                let y = cy as i64 + dy;
                if x >= 0 && y >= 0 && (x as u32) < W && (y as u32) < H {
                    data[(y as u32 * W + x as u32) as usize] = 250;
                }
            }
        }
        let pixels = std::sync::Arc::from(data);
        Frame::new(PixelBuffer::Eight(pixels), W, H, Utc::now(), seq, 1.0, 10.0, "t").unwrap()
    }

    fn flat_frame(seq: u64) -> Frame {
        let data = vec![20u8; (W * H) as usize];
        let pixels = std::sync::Arc::from(data);
        Frame::new(PixelBuffer::Eight(pixels), W, H, Utc::now(), seq, 1.0, 10.0, "t").unwrap()
    }

    #[test]
    fn translating_blob_produces_one_confirmed_event() {
        let ring = Arc::new(RingBuffer::new(400));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();

        let mut config = DetectorConfig::default();
        config.warmup_frames = 20;
        config.poll_interval = StdDuration::from_millis(10);
        config.pre_trigger_frames = 5;
        config.post_trigger_frames = 5;
        config.gap_tolerance = 1;

        let ring_for_detector = ring.clone();
        let stop_for_detector = stop.clone();
        let handle = thread::spawn(move || {
            let mut detector = Detector::new(config, ring_for_detector, stop_for_detector, tx);
            detector.run();
        });

        let mut seq = 0u64;
        for _ in 0..20 {
            ring.push(flat_frame(seq));
            seq += 1;
            thread::sleep(StdDuration::from_millis(2));
        }
        for i in 0..8u32 {
            ring.push(frame_with_blob(seq, 2 + i, 2 + i));
            seq += 1;
            thread::sleep(StdDuration::from_millis(2));
        }
        for _ in 0..10 {
            ring.push(flat_frame(seq));
            seq += 1;
            thread::sleep(StdDuration::from_millis(2));
        }

        thread::sleep(StdDuration::from_millis(150));
        stop.store(true, Ordering::SeqCst);
        ring.wake_all();
        handle.join().unwrap();

        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(events[0].trajectory.len() >= 3);
        assert!(events[0].window_start_seq < events[0].first_seen_seq);
    }

    #[test]
    fn stationary_noise_never_confirms() {
        let ring = Arc::new(RingBuffer::new(200));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();

        let mut config = DetectorConfig::default();
        config.warmup_frames = 10;
        config.poll_interval = StdDuration::from_millis(10);

        let ring_for_detector = ring.clone();
        let stop_for_detector = stop.clone();
        let handle = thread::spawn(move || {
            let mut detector = Detector::new(config, ring_for_detector, stop_for_detector, tx);
            detector.run();
        });

        for seq in 0..60u64 {
            ring.push(flat_frame(seq));
            thread::sleep(StdDuration::from_millis(2));
        }

        thread::sleep(StdDuration::from_millis(100));
        stop.store(true, Ordering::SeqCst);
        ring.wake_all();
        handle.join().unwrap();

        let events: Vec<Event> = rx.try_iter().collect();
        assert!(events.is_empty());
    }

    #[test]
    fn all_disabled_mask_suppresses_every_event() {
        let ring = Arc::new(RingBuffer::new(400));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();

        let mut config = DetectorConfig::default();
        config.warmup_frames = 20;
        config.poll_interval = StdDuration::from_millis(10);
        config.pre_trigger_frames = 5;
        config.post_trigger_frames = 5;
        config.gap_tolerance = 1;
        let mask = Mask::all_disabled(W, H);

        let ring_for_detector = ring.clone();
        let stop_for_detector = stop.clone();
        let handle = thread::spawn(move || {
            let mut detector = Detector::with_mask(config, ring_for_detector, stop_for_detector, tx, Some(mask));
            detector.run();
        });

        let mut seq = 0u64;
        for _ in 0..20 {
            ring.push(flat_frame(seq));
            seq += 1;
            thread::sleep(StdDuration::from_millis(2));
        }
        for i in 0..8u32 {
            ring.push(frame_with_blob(seq, 2 + i, 2 + i));
            seq += 1;
            thread::sleep(StdDuration::from_millis(2));
        }

        thread::sleep(StdDuration::from_millis(150));
        stop.store(true, Ordering::SeqCst);
        ring.wake_all();
        handle.join().unwrap();

        let events: Vec<Event> = rx.try_iter().collect();
        assert!(events.is_empty());
    }

    #[test]
    fn empty_ring_buffer_never_panics_detector_loop() {
        let ring = Arc::new(RingBuffer::new(10));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, _rx) = channel();
        let mut config = DetectorConfig::default();
        config.poll_interval = StdDuration::from_millis(5);

        let stop_clone = stop.clone();
        let handle = thread::spawn(move || {
            let mut detector = Detector::new(config, ring, stop_clone, tx);
            detector.run();
        });

        thread::sleep(StdDuration::from_millis(30));
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
