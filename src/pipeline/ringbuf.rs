//! Fixed-capacity frame history backing the clip pre-roll

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::Frame;
use crate::error::{ClipError, ClipResult};

/// Most-recent-N frame store.
///
/// Owned by the ingestion thread; consumers receive snapshots, never the
/// buffer itself.
pub struct FrameRingBuffer {
    /// Frames share their payload, so retaining them costs only the handle
    ring: HeapRb<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_evicted: AtomicUsize,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> ClipResult<Self> {
        if capacity == 0 {
            return Err(ClipError::config("ring buffer capacity must be positive"));
        }
        Ok(Self {
            ring: HeapRb::new(capacity),
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Insert a frame, evicting the oldest when full.
    pub fn push(&mut self, frame: Frame) {
        if self.ring.push_overwrite(frame).is_some() {
            self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Retained frames, oldest first. The buffer is left untouched.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    /// `(pushed, evicted)` since construction.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.frames_pushed.load(Ordering::Relaxed),
            self.stats.frames_evicted.load(Ordering::Relaxed),
        )
    }
}
