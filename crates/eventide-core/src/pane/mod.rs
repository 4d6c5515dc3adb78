//! # Panes
//!
//! A pane is the output of one trigger firing for a (key, window). Every
//! pane carries [`PaneInfo`] describing where it sits in the window's
//! sequence of panes and whether it was produced early, on time, or late.
//!
//! ## Accumulation Modes
//!
//! - [`AccumulationMode::Discarding`]: the buffered aggregate is cleared after
//!   every pane; each pane is an independent increment
//! - [`AccumulationMode::Accumulating`]: the buffered aggregate is kept; each
//!   pane is a superset of the previous one

mod accumulator;
mod aggregate;

pub use accumulator::{FiringKind, PaneAccumulator};
pub use aggregate::{
    AggregateError, Aggregator, AvgAggregator, CollectAggregator, CountAggregator, MaxAggregator,
    MinAggregator, SumAggregator,
};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::time::Watermark;
use crate::window::Window;

/// Timing of a pane relative to the watermark.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaneTiming {
    /// Produced before the watermark passed the window end.
    Early,
    /// The first pane produced when the watermark passed the window end.
    OnTime,
    /// Produced after the on-time pane, for data that arrived late.
    Late,
}

/// What happens to the buffered aggregate after a pane fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationMode {
    /// Clear the aggregate; each pane holds only new data.
    #[default]
    Discarding,
    /// Keep the aggregate; each pane holds all data so far.
    Accumulating,
}

/// Position and timing of a pane within its window.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
pub struct PaneInfo {
    /// Index of this pane for its (key, window), starting at 0 with no gaps
    pub index: u64,
    /// Index among ON_TIME and LATE panes; -1 for EARLY panes
    pub non_speculative_index: i64,
    /// True for the first pane of the window
    pub is_first: bool,
    /// True for the final pane of the window
    pub is_last: bool,
    /// Timing relative to the watermark
    pub timing: PaneTiming,
}

/// One emitted result for a (key, window).
#[derive(Debug, Clone, PartialEq)]
pub struct Pane<K, V> {
    /// Grouping key
    pub key: K,
    /// Window the result belongs to
    pub window: Window,
    /// Aggregated value
    pub value: V,
    /// Pane index and timing
    pub info: PaneInfo,
    /// Accumulation mode the value was produced under
    pub mode: AccumulationMode,
    /// Output watermark of the stage at emission time
    pub watermark: Watermark,
}

impl<K, V> Pane<K, V> {
    /// Returns the pane timing.
    #[must_use]
    pub fn timing(&self) -> PaneTiming {
        self.info.timing
    }

    /// Returns true if this is the final pane of the window.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.info.is_last
    }
}
