use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use sky_frame::Frame;
use tracing::warn;

/// Default capacity used when a caller does not size the buffer itself
/// (`BufferSeconds x FPS` is computed by the caller in the common case).
pub const DEFAULT_CAPACITY: usize = 900;

struct Inner {
    slots: VecDeque<Frame>,
    /// Bumped on every push; consumers wait while this is unchanged so a
    /// condvar wakeup can never be missed between check and wait.
    generation: u64,
}

/// Bounded circular buffer of recent frames.
///
/// A single mutex guards structural state — the only cross-component lock
/// in the pipeline. Two condition variables allow the Stacker and the
/// Detector to wake independently of each other: one lags, the other
/// keeps going.
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
    stacker_cv: Condvar,
    detector_cv: Condvar,
    total_written: AtomicU64,
    /// Frames dropped because the buffer was full when pushed (the
    /// StarvationWarning metric from the error-handling design).
    overflow_count: AtomicU64,
}

/// Result of [`RingBuffer::snapshot_range`]: the frames found in
/// `[first_seq, last_seq]`, plus how many requested sequence numbers had
/// already been evicted.
#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub frames: Vec<Frame>,
    pub missed: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots: VecDeque::with_capacity(capacity),
                generation: 0,
            }),
            stacker_cv: Condvar::new(),
            detector_cv: Condvar::new(),
            total_written: AtomicU64::new(0),
            overflow_count: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Push a frame, taking the exclusive lock; if full, drops the oldest
    /// slot (counting it as an overflow) before storing the new one.
    /// Signals both condition variables after releasing the lock.
    pub fn push(&self, frame: Frame) {
        {
            let mut inner = self.inner.lock().expect("ring buffer mutex poisoned");
            if inner.slots.len() == self.capacity {
                inner.slots.pop_front();
                let dropped = self.overflow_count.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    warn!(dropped, "ring buffer overflow: oldest frame evicted");
                }
            }
            inner.slots.push_back(frame);
            inner.generation = inner.generation.wrapping_add(1);
            self.total_written.fetch_add(1, Ordering::Relaxed);
        }
        // Signal outside the lock: mutate under lock, then notify.
        self.stacker_cv.notify_all();
        self.detector_cv.notify_all();
    }

    /// Block until a new frame has arrived since `last_seen_generation`, or
    /// `timeout` elapses. Returns the generation observed on return (pass
    /// it back in on the next call).
    pub fn wait_for_stacker(&self, last_seen_generation: u64, timeout: Duration) -> u64 {
        self.wait_on(&self.stacker_cv, last_seen_generation, timeout)
    }

    pub fn wait_for_detector(&self, last_seen_generation: u64, timeout: Duration) -> u64 {
        self.wait_on(&self.detector_cv, last_seen_generation, timeout)
    }

    fn wait_on(&self, cv: &Condvar, last_seen_generation: u64, timeout: Duration) -> u64 {
        let guard = self.inner.lock().expect("ring buffer mutex poisoned");
        let (guard, _) = cv
            .wait_timeout_while(guard, timeout, |inner| {
                inner.generation == last_seen_generation
            })
            .expect("ring buffer mutex poisoned");
        guard.generation
    }

    /// Break every waiter out of its condvar wait (used during shutdown).
    pub fn wake_all(&self) {
        self.stacker_cv.notify_all();
        self.detector_cv.notify_all();
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.lock().expect("ring buffer mutex poisoned").generation
    }

    /// Most recently pushed frame, without removing it.
    pub fn latest(&self) -> Option<Frame> {
        let inner = self.inner.lock().expect("ring buffer mutex poisoned");
        inner.slots.back().cloned()
    }

    /// Frames whose sequence numbers fall in `[first_seq, last_seq]` that
    /// still reside in the buffer, plus a count of how many were evicted.
    pub fn snapshot_range(&self, first_seq: u64, last_seq: u64) -> SnapshotResult {
        let inner = self.inner.lock().expect("ring buffer mutex poisoned");
        let requested = last_seq.saturating_sub(first_seq) + 1;
        let frames: Vec<Frame> = inner
            .slots
            .iter()
            .filter(|f| f.sequence >= first_seq && f.sequence <= last_seq)
            .cloned()
            .collect();
        let missed = requested.saturating_sub(frames.len() as u64);
        SnapshotResult { frames, missed }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring buffer mutex poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }
}
