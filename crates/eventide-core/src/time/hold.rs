//! Watermark holds.
//!
//! Each (key, window) with buffered data that has not produced its final pane
//! owns at most one hold. The index only needs the multiset of hold
//! timestamps to answer "what is the earliest hold", so windows are not
//! tracked here; the owning state records its own hold value.

use std::collections::BTreeMap;

/// Multiset of active hold timestamps.
#[derive(Debug, Clone, Default)]
pub struct HoldIndex {
    holds: BTreeMap<i64, usize>,
    len: usize,
}

impl HoldIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one hold at `timestamp`.
    pub fn add(&mut self, timestamp: i64) {
        *self.holds.entry(timestamp).or_insert(0) += 1;
        self.len += 1;
    }

    /// Removes one hold at `timestamp`.
    ///
    /// Returns `false` if no hold at that timestamp exists.
    pub fn remove(&mut self, timestamp: i64) -> bool {
        let Some(count) = self.holds.get_mut(&timestamp) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.holds.remove(&timestamp);
        }
        self.len -= 1;
        true
    }

    /// Returns the earliest active hold.
    #[must_use]
    pub fn min(&self) -> Option<i64> {
        self.holds.keys().next().copied()
    }

    /// Returns the number of active holds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no hold is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
