//! # Time Module
//!
//! Event-time bookkeeping for the grouping engine.
//!
//! ## Concepts
//!
//! - **Event Time**: Timestamp carried by an element (milliseconds)
//! - **Processing Time**: The runner's logical wall clock (milliseconds)
//! - **Watermark**: Assertion that no element with timestamp < watermark will arrive
//! - **Hold**: A marker that keeps the output watermark behind buffered data
//! - **Timer**: A scheduled fire-check for one (key, window)
//!
//! ## Input vs. output watermark
//!
//! The [`WatermarkTracker`] combines upstream watermarks into the *input*
//! watermark, which drives triggers, lateness and garbage collection. The
//! *output* watermark additionally respects every active hold and is what a
//! stage publishes downstream.
//!
//! ```rust
//! use eventide_core::time::{Watermark, WatermarkTracker};
//!
//! let mut tracker = WatermarkTracker::new(2);
//! tracker.update_source(0, 5000).unwrap();
//! tracker.update_source(1, 3000).unwrap();
//! assert_eq!(tracker.input_watermark(), Watermark::new(3000));
//!
//! // A hold at t=1200 keeps the output watermark behind buffered data.
//! tracker.set_hold(1200);
//! tracker.refresh_output();
//! assert_eq!(tracker.output_watermark(), Watermark::new(1200));
//! ```

mod hold;
mod timer;
mod watermark;

pub use hold::HoldIndex;
pub use timer::{FiredTimers, TimerRegistration, TimerService};
pub use watermark::{WatermarkMetrics, WatermarkTracker};

pub(crate) use watermark::TrackerSnapshot;

use serde::{Deserialize, Serialize};

/// Maximum timestamp of the global window.
///
/// One day short of `i64::MAX`, so lateness arithmetic on the global window
/// still has room before saturating.
pub const END_OF_GLOBAL_WINDOW: i64 = i64::MAX - 86_400_000;

/// A watermark indicating event time progress.
///
/// Watermarks are monotonically increasing assertions that no events with
/// timestamps earlier than the watermark will arrive.
///
/// # Example
///
/// ```rust
/// use eventide_core::time::Watermark;
///
/// let watermark = Watermark::new(1000);
///
/// assert!(watermark.is_late(999));
/// assert!(!watermark.is_late(1000));
/// assert!(Watermark::MIN < watermark);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(pub i64);

impl Watermark {
    /// The initial watermark: nothing is known about event time yet.
    pub const MIN: Watermark = Watermark(i64::MIN);

    /// The final watermark: the input is exhausted.
    pub const MAX: Watermark = Watermark(i64::MAX);

    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp in milliseconds.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Checks if an event is late relative to this watermark.
    ///
    /// An event is considered late if its timestamp is strictly less than
    /// the watermark timestamp.
    #[inline]
    #[must_use]
    pub fn is_late(&self, event_time: i64) -> bool {
        event_time < self.0
    }

    /// Returns true if the watermark has passed `timestamp`.
    #[inline]
    #[must_use]
    pub fn is_past(&self, timestamp: i64) -> bool {
        self.0 > timestamp
    }

    /// Returns the minimum (earlier) of two watermarks.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Returns the maximum (later) of two watermarks.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::MIN
    }
}

impl From<i64> for Watermark {
    fn from(timestamp: i64) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

/// The clock a timer is scheduled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeDomain {
    /// Fires when the input watermark reaches the timer timestamp.
    EventTime,
    /// Fires when the processing clock reaches the timer timestamp.
    ProcessingTime,
}

/// Converts a `Duration` to whole milliseconds, failing if it does not fit in `i64`.
///
/// # Errors
///
/// Returns [`TimeError::DurationOverflow`] for durations beyond `i64::MAX` ms.
pub fn duration_millis(duration: std::time::Duration) -> Result<i64, TimeError> {
    i64::try_from(duration.as_millis()).map_err(|_| TimeError::DurationOverflow)
}

/// Errors that can occur in time operations.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// Watermark update for a source that does not exist
    #[error("Unknown watermark source {source_id} (stage has {num_sources})")]
    UnknownSource {
        /// Offending source index
        source_id: usize,
        /// Number of configured sources
        num_sources: usize,
    },

    /// A duration does not fit in `i64` milliseconds
    #[error("Duration does not fit in i64 milliseconds")]
    DurationOverflow,
}
