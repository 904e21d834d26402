//! Thread lifecycle owner.
//!
//! Spawns and owns every long-lived thread (the frame source producer, the
//! stacker, the detector, the event recorder), installs the
//! termination-signal observer, and drives shutdown in order: stop the
//! frame source, let the ring buffer drain, stop the detector (closing out
//! any in-flight candidate), stop the stacker (flushing a partial stack
//! only if at least half full), then join every worker and let the sinks
//! drop.
//!
//! Only one `EventRecorder` worker is spawned; a small pool bounded to
//! prevent disk I/O from starving CPU work is a reasonable alternative,
//! which this crate does not need at the scale a single all-sky station
//! produces events.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use detector::{Detector, DetectorConfig, Event};
use event_recorder::{EventRecorder, EventRecorderConfig, StorageSink};
use frame_source::{FrameSource, RunContext};
use ring_buffer::RingBuffer;
use sky_frame::Mask;
use stacker::{Stacker, StackerConfig, StackSink};
use tracing::{error, info, warn};

/// Which component reported a fatal error first; printed at exit so the
/// operator sees the root cause rather than a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalComponent {
    FrameSource,
    Detector,
    Stacker,
    EventRecorder,
}

impl fmt::Display for FatalComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FatalComponent::FrameSource => "frame-source",
            FatalComponent::Detector => "detector",
            FatalComponent::Stacker => "stacker",
            FatalComponent::EventRecorder => "event-recorder",
        };
        write!(f, "{name}")
    }
}

/// Shared handles every spawned thread closes over: the stop flag and the
/// ring buffer they read from / signal through.
#[derive(Clone)]
pub struct PipelineHandles {
    pub stop: Arc<AtomicBool>,
    pub ring: Arc<RingBuffer>,
    pub fatal_from: Arc<Mutex<Option<FatalComponent>>>,
}

impl PipelineHandles {
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            ring,
            fatal_from: Arc::new(Mutex::new(None)),
        }
    }

    fn mark_fatal(&self, component: FatalComponent) {
        let mut slot = self.fatal_from.lock().expect("fatal_from mutex poisoned");
        if slot.is_none() {
            *slot = Some(component);
        }
    }
}

pub struct Supervisor {
    handles: PipelineHandles,
    source_handle: Option<JoinHandle<()>>,
    detector_handle: Option<JoinHandle<()>>,
    stacker_handle: Option<JoinHandle<()>>,
    recorder_handle: Option<JoinHandle<()>>,
    frame_source_failed: Option<Arc<AtomicBool>>,
    started_at: Instant,
    execution_time_limit: Option<Duration>,
}

impl Supervisor {
    /// Wires and spawns the full pipeline: FrameSource -> RingBuffer ->
    /// {Stacker, Detector} -> EventRecorder -> StorageSink. `stack_sink`
    /// and `storage_sink` are moved in as the final destination for closed
    /// stacks and materialized events respectively.
    pub fn spawn(
        mut source: FrameSource,
        source_tag: String,
        ring: Arc<RingBuffer>,
        detector_config: DetectorConfig,
        mask: Option<Mask>,
        stacker_config: StackerConfig,
        stack_sink: Box<dyn StackSink>,
        recorder_config: EventRecorderConfig,
        storage_sink: Box<dyn StorageSink>,
        execution_time_limit: Option<Duration>,
        frame_source_failed: Option<Arc<AtomicBool>>,
    ) -> Self {
        let handles = PipelineHandles::new(ring.clone());

        let source_ctx = RunContext {
            ring: ring.clone(),
            stop: handles.stop.clone(),
            source_tag,
        };
        let source_handles = handles.clone();
        let source_handle = thread::spawn(move || {
            if let Err(e) = source.run(&source_ctx) {
                error!(error = %e, "frame source terminated with error");
                source_handles.mark_fatal(FatalComponent::FrameSource);
            }
        });

        let (event_tx, event_rx) = mpsc::channel::<Event>();

        let detector_ring = ring.clone();
        let detector_stop = handles.stop.clone();
        let detector_handle = thread::spawn(move || {
            let mut detector = Detector::with_mask(detector_config, detector_ring, detector_stop, event_tx, mask);
            detector.run();
        });

        let stacker_ring = ring.clone();
        let stacker_stop = handles.stop.clone();
        let stacker_handle = thread::spawn(move || {
            let mut stacker = Stacker::new(stacker_config, stacker_ring, stacker_stop, stack_sink);
            stacker.run();
        });

        let recorder_ring = ring.clone();
        let recorder_stop = handles.stop.clone();
        let recorder_handle = thread::spawn(move || {
            let mut recorder = EventRecorder::new(recorder_config, recorder_ring, recorder_stop, event_rx, storage_sink);
            recorder.run();
        });

        let mut supervisor = Self {
            handles,
            source_handle: Some(source_handle),
            detector_handle: Some(detector_handle),
            stacker_handle: Some(stacker_handle),
            recorder_handle: Some(recorder_handle),
            frame_source_failed,
            started_at: Instant::now(),
            execution_time_limit,
        };
        supervisor.install_signal_handler();
        supervisor
    }

    /// Installs the SIGTERM/SIGINT observer: flips the shared stop flag and
    /// wakes any ring-buffer waiter so shutdown proceeds without waiting
    /// out a full poll interval.
    fn install_signal_handler(&self) {
        let stop = self.handles.stop.clone();
        let ring = self.handles.ring.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("termination signal received, starting graceful shutdown");
            stop.store(true, Ordering::SeqCst);
            ring.wake_all();
        }) {
            warn!(error = %e, "failed to install termination signal handler");
        }
    }

    /// Blocks the calling thread until the stop flag is set (by a signal,
    /// by `--time` elapsing, or by the frame source reporting a hard
    /// disconnect), then runs the shutdown sequence.
    pub fn run_until_stopped(&mut self) {
        loop {
            if self.handles.stop.load(Ordering::Relaxed) {
                break;
            }
            if let Some(limit) = self.execution_time_limit {
                if self.started_at.elapsed() >= limit {
                    info!(seconds = limit.as_secs(), "--time limit elapsed, shutting down");
                    break;
                }
            }
            if let Some(failed) = &self.frame_source_failed {
                if failed.load(Ordering::Relaxed) {
                    warn!("frame source reported a hard failure, shutting down");
                    self.handles.mark_fatal(FatalComponent::FrameSource);
                    break;
                }
            }
            thread::sleep(Duration::from_millis(100));
        }
        self.shutdown();
    }

    /// Stop FrameSource -> drain RingBuffer -> stop Detector -> stop
    /// Stacker -> join EventRecorder (sinks drop once their owning thread
    /// returns). Each join happens in this order; shutdown is a
    /// shared-stop-flag cooperative model throughout.
    pub fn shutdown(&mut self) {
        self.handles.stop.store(true, Ordering::SeqCst);
        self.handles.ring.wake_all();

        if let Some(h) = self.source_handle.take() {
            let _ = h.join();
        }
        // RingBuffer drains naturally: no further pushes occur once the
        // frame source has returned.
        if let Some(h) = self.detector_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.stacker_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.recorder_handle.take() {
            let _ = h.join();
        }

        if let Some(component) = *self.handles.fatal_from.lock().expect("fatal_from mutex poisoned") {
            error!(component = %component, "pipeline exited due to a fatal error");
        } else {
            info!("pipeline shut down cleanly");
        }
    }

    pub fn fatal_component(&self) -> Option<FatalComponent> {
        *self.handles.fatal_from.lock().expect("fatal_from mutex poisoned")
    }
}
