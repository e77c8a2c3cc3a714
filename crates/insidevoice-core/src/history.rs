//! Bounded history of loudness readings
//!
//! Keeps the most recent [`HISTORY_CAPACITY`] one-second averages in a fixed
//! arena. When full, a push overwrites the oldest entry; the history never
//! blocks, grows or rejects a write.
//!
//! Entries are addressed by logical index: 0 is the oldest sample currently
//! retained, `count() - 1` the newest, whatever the physical layout.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Maximum number of samples retained (8000 s, about 2.2 hours at 1 sample/s)
pub const HISTORY_CAPACITY: usize = 8000;

/// A single averaged loudness reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoudnessSample {
    /// Device uptime when the sample was committed (ms, wraps after ~49 days)
    pub timestamp_ms: u32,
    /// Averaged level in pseudo-SPL dB (0..=90)
    pub level_db: u8,
}

/// Fixed-capacity circular store with overwrite-oldest eviction
///
/// Not synchronized; [`SampleHistory`] wraps it in a mutex.
#[derive(Debug)]
pub struct SampleRing {
    /// Backing arena, allocated once
    slots: Vec<LoudnessSample>,
    /// Physical index of the oldest entry
    tail: usize,
    /// Number of retained entries
    len: usize,
    /// Entries dropped by eviction since creation
    evicted: u64,
}

impl SampleRing {
    /// Create a ring holding at most `capacity` samples (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![LoudnessSample::default(); capacity.max(1)],
            tail: 0,
            len: 0,
            evicted: 0,
        }
    }

    /// Append a sample, returning the evicted oldest one if the ring was full
    pub fn push(&mut self, sample: LoudnessSample) -> Option<LoudnessSample> {
        let capacity = self.slots.len();
        let head = (self.tail + self.len) % capacity;

        if self.len == capacity {
            let evicted = self.slots[head];
            self.slots[head] = sample;
            self.tail = (self.tail + 1) % capacity;
            self.evicted += 1;
            Some(evicted)
        } else {
            self.slots[head] = sample;
            self.len += 1;
            None
        }
    }

    /// Sample at logical index, or `None` when `index >= len()`
    pub fn get(&self, index: usize) -> Option<LoudnessSample> {
        if index >= self.len {
            return None;
        }
        Some(self.slots[(self.tail + index) % self.slots.len()])
    }

    /// Number of retained samples
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the ring holds no samples
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of samples
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Entries lost to eviction since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Drop every sample (O(1), the arena is kept)
    pub fn clear(&mut self) {
        self.tail = 0;
        self.len = 0;
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = LoudnessSample> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }
}

/// Shared sample history
///
/// Written by the acquisition thread, read by the sync walk. Every operation
/// takes the one lock, so a reader never observes a half-written entry.
#[derive(Debug)]
pub struct SampleHistory {
    ring: Mutex<SampleRing>,
    /// Time origin for sample timestamps (device boot)
    epoch: Instant,
}

impl SampleHistory {
    /// Create a history with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    /// Create a history with a custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(SampleRing::new(capacity)),
            epoch: Instant::now(),
        }
    }

    fn ring(&self) -> MutexGuard<'_, SampleRing> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Milliseconds since the history was created
    pub fn uptime_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Record a level stamped with the current uptime
    pub fn push(&self, level_db: u8) -> LoudnessSample {
        let sample = LoudnessSample {
            timestamp_ms: self.uptime_ms(),
            level_db,
        };
        self.push_sample(sample);
        sample
    }

    /// Record a level with an explicit timestamp
    pub fn push_at(&self, timestamp_ms: u32, level_db: u8) {
        self.push_sample(LoudnessSample {
            timestamp_ms,
            level_db,
        });
    }

    fn push_sample(&self, sample: LoudnessSample) {
        if let Some(evicted) = self.ring().push(sample) {
            tracing::trace!(
                timestamp_ms = evicted.timestamp_ms,
                "history full, evicted oldest sample"
            );
        }
    }

    /// Number of retained samples
    pub fn count(&self) -> usize {
        self.ring().len()
    }

    /// Sample at logical index (0 = oldest), `None` when out of range
    pub fn get(&self, index: usize) -> Option<LoudnessSample> {
        self.ring().get(index)
    }

    /// Drop every sample
    pub fn clear(&self) {
        self.ring().clear();
        tracing::info!("Sample history cleared");
    }

    /// Maximum number of samples
    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }

    /// Copy of every retained sample, oldest first
    pub fn snapshot(&self) -> Vec<LoudnessSample> {
        self.ring().iter().collect()
    }
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new()
    }
}
