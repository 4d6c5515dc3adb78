//! # Watermark Tracking
//!
//! A stage receives watermarks from one or more upstream sources. The
//! [`WatermarkTracker`] combines them into the stage's *input* watermark and,
//! taking active holds into account, its *output* watermark.
//!
//! ## Idle Source Handling
//!
//! A source that stops producing can block watermark progress. Sources marked
//! idle are excluded from the minimum until they report a watermark again.
//!
//! ## Regressions
//!
//! A source watermark lower than the one already recorded for that source is
//! rejected: it is logged, counted, and otherwise ignored.

use tracing::warn;

use super::{HoldIndex, TimeError, Watermark};

/// Counters describing watermark progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkMetrics {
    /// Current input watermark timestamp
    pub input_watermark: i64,
    /// Current output watermark timestamp
    pub output_watermark: i64,
    /// Number of times the input watermark advanced
    pub input_advances: u64,
    /// Number of times the output watermark advanced
    pub output_advances: u64,
    /// Number of rejected regressive source updates
    pub regressions_rejected: u64,
}

impl WatermarkMetrics {
    /// Creates new metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how far holds keep the output watermark behind the input.
    #[must_use]
    pub fn hold_lag(&self) -> i64 {
        self.input_watermark.saturating_sub(self.output_watermark)
    }
}

impl Default for WatermarkMetrics {
    fn default() -> Self {
        Self {
            input_watermark: i64::MIN,
            output_watermark: i64::MIN,
            input_advances: 0,
            output_advances: 0,
            regressions_rejected: 0,
        }
    }
}

/// Tracks upstream watermarks and holds for one processing stage.
///
/// The input watermark is the minimum over non-idle sources. The output
/// watermark is `max(previous output, min(input, earliest hold))`. Both are
/// monotonically non-decreasing.
///
/// # Example
///
/// ```rust
/// use eventide_core::time::{WatermarkTracker, Watermark};
///
/// let mut tracker = WatermarkTracker::new(3); // 3 sources
///
/// // Source 0 advances to 1000
/// let wm = tracker.update_source(0, 1000).unwrap();
/// assert_eq!(wm, None); // Other sources still at MIN
///
/// tracker.update_source(1, 2000).unwrap();
///
/// let wm = tracker.update_source(2, 500).unwrap();
/// assert_eq!(wm, Some(Watermark::new(500))); // Min of all sources
///
/// // Regressions are ignored
/// assert_eq!(tracker.update_source(2, 100).unwrap(), None);
/// assert_eq!(tracker.input_watermark(), Watermark::new(500));
/// ```
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    /// Watermark for each source
    source_watermarks: Vec<i64>,
    /// Idle status for each source
    idle_sources: Vec<bool>,
    /// Combined minimum over active sources
    input: i64,
    /// Input watermark held back by active holds
    output: i64,
    /// Active holds
    holds: HoldIndex,
    metrics: WatermarkMetrics,
}

/// Everything in a [`WatermarkTracker`] except its holds.
///
/// Holds are journaled individually by the engine, so a unit of work only
/// needs to capture the scalar part of the tracker.
#[derive(Debug, Clone)]
pub(crate) struct TrackerSnapshot {
    source_watermarks: Vec<i64>,
    idle_sources: Vec<bool>,
    input: i64,
    output: i64,
    metrics: WatermarkMetrics,
}

impl WatermarkTracker {
    /// Creates a new tracker for the specified number of sources.
    #[must_use]
    pub fn new(num_sources: usize) -> Self {
        Self {
            source_watermarks: vec![i64::MIN; num_sources],
            idle_sources: vec![false; num_sources],
            input: i64::MIN,
            output: i64::MIN,
            holds: HoldIndex::new(),
            metrics: WatermarkMetrics::new(),
        }
    }

    /// Updates the watermark for a specific source and refreshes the output.
    ///
    /// A source whose watermark is accepted is no longer idle. A regressive
    /// watermark only moves the rejection counter. Returns
    /// `Some(Watermark)` if the input watermark advanced.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownSource`] if `source_id` is out of range.
    pub fn update_source(
        &mut self,
        source_id: usize,
        watermark: i64,
    ) -> Result<Option<Watermark>, TimeError> {
        let current = self.source(source_id)?;
        if watermark < current {
            self.metrics.regressions_rejected += 1;
            warn!(
                source_id,
                current,
                rejected = watermark,
                "rejected regressive watermark"
            );
            return Ok(None);
        }

        self.idle_sources[source_id] = false;
        self.source_watermarks[source_id] = watermark;
        let advanced = self.update_input();
        self.refresh_output();
        Ok(advanced)
    }

    /// Applies one watermark per source (index = source id) and returns the
    /// resulting output watermark.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownSource`] if more watermarks than sources
    /// are supplied. No update is applied in that case.
    pub fn advance(&mut self, upstream: &[i64]) -> Result<Watermark, TimeError> {
        if upstream.len() > self.source_watermarks.len() {
            return Err(TimeError::UnknownSource {
                source_id: self.source_watermarks.len(),
                num_sources: self.source_watermarks.len(),
            });
        }
        for (source_id, &watermark) in upstream.iter().enumerate() {
            self.update_source(source_id, watermark)?;
        }
        Ok(self.output_watermark())
    }

    /// Marks a source as idle, excluding it from the input watermark.
    ///
    /// Returns `Some(Watermark)` if the input watermark advanced.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownSource`] if `source_id` is out of range.
    pub fn mark_idle(&mut self, source_id: usize) -> Result<Option<Watermark>, TimeError> {
        self.source(source_id)?;
        self.idle_sources[source_id] = true;
        let advanced = self.update_input();
        self.refresh_output();
        Ok(advanced)
    }

    /// Registers a hold at `timestamp`.
    ///
    /// The hold takes effect on the next [`refresh_output`](Self::refresh_output).
    pub fn set_hold(&mut self, timestamp: i64) {
        self.holds.add(timestamp);
    }

    /// Releases a hold previously registered at `timestamp`.
    ///
    /// Returns `false` if no such hold exists.
    pub fn release_hold(&mut self, timestamp: i64) -> bool {
        self.holds.remove(timestamp)
    }

    /// Recomputes the output watermark from the input and the active holds.
    ///
    /// Returns `Some(Watermark)` if the output watermark advanced.
    pub fn refresh_output(&mut self) -> Option<Watermark> {
        let held = match self.holds.min() {
            Some(hold) => self.input.min(hold),
            None => self.input,
        };
        if held > self.output {
            self.output = held;
            self.metrics.output_watermark = held;
            self.metrics.output_advances += 1;
            Some(Watermark::new(held))
        } else {
            None
        }
    }

    /// Returns the input watermark (minimum over active sources).
    #[must_use]
    pub fn input_watermark(&self) -> Watermark {
        Watermark::new(self.input)
    }

    /// Returns the output watermark (input held back by active holds).
    #[must_use]
    pub fn output_watermark(&self) -> Watermark {
        Watermark::new(self.output)
    }

    /// Returns the earliest active hold.
    #[must_use]
    pub fn min_hold(&self) -> Option<i64> {
        self.holds.min()
    }

    /// Returns the number of active holds.
    #[must_use]
    pub fn active_holds(&self) -> usize {
        self.holds.len()
    }

    /// Returns the watermark for a specific source.
    #[must_use]
    pub fn source_watermark(&self, source_id: usize) -> Option<i64> {
        self.source_watermarks.get(source_id).copied()
    }

    /// Returns whether a source is marked as idle.
    #[must_use]
    pub fn is_idle(&self, source_id: usize) -> bool {
        self.idle_sources.get(source_id).copied().unwrap_or(false)
    }

    /// Returns the number of sources being tracked.
    #[must_use]
    pub fn num_sources(&self) -> usize {
        self.source_watermarks.len()
    }

    /// Returns the watermark counters.
    #[must_use]
    pub fn metrics(&self) -> &WatermarkMetrics {
        &self.metrics
    }

    pub(crate) fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            source_watermarks: self.source_watermarks.clone(),
            idle_sources: self.idle_sources.clone(),
            input: self.input,
            output: self.output,
            metrics: self.metrics,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: TrackerSnapshot) {
        self.source_watermarks = snapshot.source_watermarks;
        self.idle_sources = snapshot.idle_sources;
        self.input = snapshot.input;
        self.output = snapshot.output;
        self.metrics = snapshot.metrics;
    }

    fn source(&self, source_id: usize) -> Result<i64, TimeError> {
        self.source_watermarks
            .get(source_id)
            .copied()
            .ok_or(TimeError::UnknownSource {
                source_id,
                num_sources: self.source_watermarks.len(),
            })
    }

    /// Updates the input watermark based on all active sources.
    fn update_input(&mut self) -> Option<Watermark> {
        let active = self
            .source_watermarks
            .iter()
            .zip(&self.idle_sources)
            .filter(|(_, &idle)| !idle)
            .map(|(&wm, _)| wm)
            .min();

        // If all sources are idle, use the max watermark
        let combined = active.unwrap_or_else(|| {
            self.source_watermarks
                .iter()
                .copied()
                .max()
                .unwrap_or(i64::MIN)
        });

        if combined > self.input {
            self.input = combined;
            self.metrics.input_watermark = combined;
            self.metrics.input_advances += 1;
            Some(Watermark::new(combined))
        } else {
            None
        }
    }
}
