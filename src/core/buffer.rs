//! Bounded Buffers
//!
//! Time-ordered ring buffers used for snapshot and prediction retention, and
//! fixed-capacity rolling histories used for statistics.

use std::collections::VecDeque;

use super::time::Millis;

// =============================================================================
// TIMED BUFFER
// =============================================================================

/// Time-ordered buffer that evicts entries by age and by capacity.
///
/// Entries are kept sorted by timestamp. Entries with equal timestamps keep
/// insertion order.
#[derive(Debug, Clone)]
pub struct TimedBuffer<T> {
    entries: VecDeque<(Millis, T)>,
    retention_ms: Millis,
    capacity: usize,
}

impl<T> TimedBuffer<T> {
    /// Create a buffer retaining entries for `retention_ms`, never holding
    /// more than `capacity` entries.
    pub fn new(retention_ms: Millis, capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            retention_ms,
            capacity: capacity.max(1),
        }
    }

    /// Insert an entry at its time position. Oldest entries are dropped when
    /// the buffer is full. Returns the number of entries dropped.
    pub fn push(&mut self, t: Millis, value: T) -> usize {
        let idx = self.entries.partition_point(|(et, _)| *et <= t);
        self.entries.insert(idx, (t, value));

        let mut dropped = 0;
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Remove entries older than the retention window ending at `now`.
    /// Returns the number of entries removed.
    pub fn evict_stale(&mut self, now: Millis) -> usize {
        let cutoff = now.saturating_sub(self.retention_ms);
        let mut removed = 0;
        while let Some((t, _)) = self.entries.front() {
            if *t >= cutoff {
                break;
            }
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<(Millis, &T)> {
        self.entries.back().map(|(t, v)| (*t, v))
    }

    /// Oldest entry.
    pub fn earliest(&self) -> Option<(Millis, &T)> {
        self.entries.front().map(|(t, v)| (*t, v))
    }

    /// The two entries surrounding `target`: `t0 <= target < t1`.
    ///
    /// Returns `None` when `target` is before the first entry or at/after
    /// the last one.
    pub fn bracket(&self, target: Millis) -> Option<((Millis, &T), (Millis, &T))> {
        let idx = self.entries.partition_point(|(t, _)| *t <= target);
        if idx == 0 || idx >= self.entries.len() {
            return None;
        }
        let (t0, v0) = &self.entries[idx - 1];
        let (t1, v1) = &self.entries[idx];
        Some(((*t0, v0), (*t1, v1)))
    }

    /// Remove and return every entry matching the predicate, oldest first.
    pub fn take_where<F>(&mut self, mut pred: F) -> Vec<(Millis, T)>
    where
        F: FnMut(Millis, &T) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for (t, v) in self.entries.drain(..) {
            if pred(t, &v) {
                taken.push((t, v));
            } else {
                kept.push_back((t, v));
            }
        }
        self.entries = kept;
        taken
    }

    /// Keep only entries matching the predicate.
    pub fn retain<F>(&mut self, mut pred: F)
    where
        F: FnMut(Millis, &T) -> bool,
    {
        self.entries.retain(|(t, v)| pred(*t, v));
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (Millis, &T)> {
        self.entries.iter().map(|(t, v)| (*t, v))
    }

    /// Number of entries stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retention window in ms.
    pub fn retention_ms(&self) -> Millis {
        self.retention_ms
    }
}

// =============================================================================
// ROLLING HISTORY
// =============================================================================

/// Fixed-capacity FIFO history. Oldest values are evicted first.
#[derive(Debug, Clone)]
pub struct RollingHistory<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingHistory<T> {
    /// Create an empty history holding at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a value, evicting the oldest when full.
    pub fn push(&mut self, value: T) {
        if self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.values.iter()
    }

    /// Most recent value.
    pub fn last(&self) -> Option<&T> {
        self.values.back()
    }

    /// Number of values stored.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if history is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Maximum number of values retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Mean of a slice-like iterator of `f32`, `None` when empty.
pub fn mean<'a, I>(values: I) -> Option<f32>
where
    I: IntoIterator<Item = &'a f32>,
{
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for v in values {
        sum += *v as f64;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some((sum / count as f64) as f32)
    }
}

// =============================================================================
// TESTS
// =============================================================================
