//! Diagnostic counters of a grouping engine.
//!
//! Counters are part of the engine's state: a failed unit of work restores
//! them together with everything else, so a retry never double counts.

use crate::pane::PaneTiming;

/// Counters describing what an engine has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineMetrics {
    /// Elements handed to the engine
    pub elements_processed: u64,
    /// Element-window assignments dropped because the window had expired
    pub dropped_expired: u64,
    /// Element-window assignments dropped because the window was terminal
    pub dropped_closed: u64,
    /// Windows created
    pub windows_created: u64,
    /// Windows merged away into another window
    pub windows_merged: u64,
    /// Windows destroyed after their garbage-collection time
    pub windows_expired: u64,
    /// EARLY panes emitted
    pub panes_early: u64,
    /// ON_TIME panes emitted
    pub panes_on_time: u64,
    /// LATE panes emitted
    pub panes_late: u64,
    /// Timers that fired for windows that no longer exist
    pub stale_timers: u64,
    /// Upstream watermark updates rejected as regressions
    pub regressions_rejected: u64,
}

impl EngineMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of panes emitted.
    #[must_use]
    pub fn panes_emitted(&self) -> u64 {
        self.panes_early + self.panes_on_time + self.panes_late
    }

    /// Returns the total number of dropped element-window assignments.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_expired + self.dropped_closed
    }

    /// Records an emitted pane.
    pub fn record_pane(&mut self, timing: PaneTiming) {
        match timing {
            PaneTiming::Early => self.panes_early += 1,
            PaneTiming::OnTime => self.panes_on_time += 1,
            PaneTiming::Late => self.panes_late += 1,
        }
    }

    /// Adds another engine's counters to these, e.g. across partitions.
    pub fn merge(&mut self, other: &Self) {
        self.elements_processed += other.elements_processed;
        self.dropped_expired += other.dropped_expired;
        self.dropped_closed += other.dropped_closed;
        self.windows_created += other.windows_created;
        self.windows_merged += other.windows_merged;
        self.windows_expired += other.windows_expired;
        self.panes_early += other.panes_early;
        self.panes_on_time += other.panes_on_time;
        self.panes_late += other.panes_late;
        self.stale_timers += other.stale_timers;
        self.regressions_rejected += other.regressions_rejected;
    }
}
