//! Pre-trigger ring buffer
//!
//! Bounded circular buffer of recent frames, the substrate the Detector's
//! event recorder slices a `[firstSeen - Pre, lastSeen + Post]` window out
//! of. Overwrite-on-full: a lagging consumer loses history, never blocks
//! the producer.

mod buffer;

pub use buffer::{RingBuffer, SnapshotResult};
