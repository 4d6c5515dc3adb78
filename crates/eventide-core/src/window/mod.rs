//! # Windows
//!
//! Window identities and the assigners that map an element timestamp to the
//! windows it belongs to.
//!
//! ## Assigners
//!
//! - **Fixed**: non-overlapping windows of length `size`, aligned to `offset`
//! - **Sliding**: windows of length `size` starting every `period`; an element
//!   belongs to up to `ceil(size / period)` windows
//! - **Session**: each element opens `[ts, ts + gap)`; overlapping sessions are
//!   merged by [`merge_windows`]
//! - **Global**: a single window spanning all of time
//!
//! ```rust
//! use eventide_core::window::{Window, WindowAssigner};
//!
//! let sliding = WindowAssigner::sliding(60, 20).unwrap();
//! let windows = sliding.assign(70);
//! assert_eq!(
//!     windows.as_slice(),
//!     &[
//!         Window::interval(20, 80),
//!         Window::interval(40, 100),
//!         Window::interval(60, 120),
//!     ]
//! );
//! ```

mod merge;

pub use merge::{merge_windows, MergeGroup, UnionFind};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::engine::ConfigError;
use crate::time::END_OF_GLOBAL_WINDOW;

/// Collection type for window assignments.
///
/// Uses `SmallVec` to avoid heap allocation for common cases:
/// - 1 window: fixed, session and global windows
/// - 2-4 windows: sliding windows with small overlap
pub type WindowVec = SmallVec<[Window; 4]>;

/// Identity of a window.
///
/// Interval windows are half-open `[start, end)`. Ordering is by start, then
/// end, with the global window after every interval.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
pub enum Window {
    /// A bounded interval of event time.
    Interval {
        /// Window start timestamp (inclusive, in milliseconds)
        start: i64,
        /// Window end timestamp (exclusive, in milliseconds)
        end: i64,
    },
    /// The single window spanning all of event time.
    Global,
}

impl Window {
    /// Creates an interval window `[start, end)`.
    #[inline]
    #[must_use]
    pub fn interval(start: i64, end: i64) -> Self {
        Self::Interval { start, end }
    }

    /// Returns the window start (inclusive).
    #[must_use]
    pub fn start(&self) -> i64 {
        match self {
            Self::Interval { start, .. } => *start,
            Self::Global => i64::MIN,
        }
    }

    /// Returns the window end (exclusive).
    ///
    /// This is the watermark at which the window is complete.
    #[must_use]
    pub fn end(&self) -> i64 {
        match self {
            Self::Interval { end, .. } => *end,
            Self::Global => END_OF_GLOBAL_WINDOW + 1,
        }
    }

    /// Returns the largest timestamp that belongs to the window.
    #[inline]
    #[must_use]
    pub fn max_timestamp(&self) -> i64 {
        match self {
            Self::Interval { end, .. } => end.saturating_sub(1),
            Self::Global => END_OF_GLOBAL_WINDOW,
        }
    }

    /// Returns true if `timestamp` falls inside the window.
    #[must_use]
    pub fn contains(&self, timestamp: i64) -> bool {
        match self {
            Self::Interval { start, end } => *start <= timestamp && timestamp < *end,
            Self::Global => true,
        }
    }

    /// Returns the watermark at which the window state may be collected.
    ///
    /// This is the first watermark strictly past
    /// `max_timestamp + allowed_lateness`.
    #[must_use]
    pub fn gc_time(&self, allowed_lateness: i64) -> i64 {
        self.max_timestamp()
            .saturating_add(allowed_lateness)
            .saturating_add(1)
    }

    /// Returns true if a watermark of `watermark` has expired the window.
    ///
    /// The final watermark (`i64::MAX`) expires every window.
    #[must_use]
    pub fn is_expired(&self, allowed_lateness: i64, watermark: i64) -> bool {
        watermark == i64::MAX
            || self.max_timestamp().saturating_add(allowed_lateness) < watermark
    }

    /// Returns the smallest interval covering both windows.
    ///
    /// The span of anything with the global window is the global window.
    #[must_use]
    pub fn span(&self, other: &Window) -> Window {
        match (self, other) {
            (
                Self::Interval { start: s1, end: e1 },
                Self::Interval { start: s2, end: e2 },
            ) => Self::Interval {
                start: (*s1).min(*s2),
                end: (*e1).max(*e2),
            },
            _ => Self::Global,
        }
    }

    /// Returns the window duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.end().saturating_sub(self.start())
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval { start, end } => write!(f, "[{start}, {end})"),
            Self::Global => f.write_str("GlobalWindow"),
        }
    }
}

/// Maps element timestamps to windows.
///
/// Assigners are plain configuration values; they can be built with the
/// validating constructors or deserialized and checked with
/// [`validate`](Self::validate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowAssigner {
    /// Non-overlapping windows of fixed length.
    Fixed {
        /// Window length in milliseconds
        size_ms: i64,
        /// Alignment offset in milliseconds (`0 <= offset < size`)
        #[serde(default)]
        offset_ms: i64,
    },
    /// Overlapping windows of fixed length starting every `period_ms`.
    Sliding {
        /// Window length in milliseconds
        size_ms: i64,
        /// Distance between window starts in milliseconds (`period <= size`)
        period_ms: i64,
        /// Alignment offset in milliseconds (`0 <= offset < period`)
        #[serde(default)]
        offset_ms: i64,
    },
    /// Per-element windows merged when they come within `gap_ms`.
    Session {
        /// Session gap in milliseconds
        gap_ms: i64,
    },
    /// A single window spanning all of event time.
    Global,
}

impl WindowAssigner {
    /// Creates a fixed window assigner aligned to the epoch.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWindowSize`] if `size_ms <= 0`.
    pub fn fixed(size_ms: i64) -> Result<Self, ConfigError> {
        Self::fixed_with_offset(size_ms, 0)
    }

    /// Creates a fixed window assigner whose windows start at `offset_ms + k * size_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWindowSize`] if `size_ms <= 0`, or
    /// [`ConfigError::InvalidOffset`] if the offset is outside `[0, size_ms)`.
    pub fn fixed_with_offset(size_ms: i64, offset_ms: i64) -> Result<Self, ConfigError> {
        let assigner = Self::Fixed { size_ms, offset_ms };
        assigner.validate()?;
        Ok(assigner)
    }

    /// Creates a sliding window assigner aligned to the epoch.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWindowSize`] if `size_ms <= 0`, or
    /// [`ConfigError::InvalidPeriod`] unless `0 < period_ms <= size_ms`.
    pub fn sliding(size_ms: i64, period_ms: i64) -> Result<Self, ConfigError> {
        Self::sliding_with_offset(size_ms, period_ms, 0)
    }

    /// Creates a sliding window assigner whose windows start at `offset_ms + k * period_ms`.
    ///
    /// # Errors
    ///
    /// As [`sliding`](Self::sliding), plus [`ConfigError::InvalidOffset`] if
    /// the offset is outside `[0, period_ms)`.
    pub fn sliding_with_offset(
        size_ms: i64,
        period_ms: i64,
        offset_ms: i64,
    ) -> Result<Self, ConfigError> {
        let assigner = Self::Sliding {
            size_ms,
            period_ms,
            offset_ms,
        };
        assigner.validate()?;
        Ok(assigner)
    }

    /// Creates a session window assigner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidGap`] if `gap_ms <= 0`.
    pub fn session(gap_ms: i64) -> Result<Self, ConfigError> {
        let assigner = Self::Session { gap_ms };
        assigner.validate()?;
        Ok(assigner)
    }

    /// Creates the global window assigner.
    #[must_use]
    pub fn global() -> Self {
        Self::Global
    }

    /// Checks the assigner parameters.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found in the parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Fixed { size_ms, offset_ms } => {
                if size_ms <= 0 {
                    return Err(ConfigError::InvalidWindowSize(size_ms));
                }
                check_offset(offset_ms, size_ms)
            }
            Self::Sliding {
                size_ms,
                period_ms,
                offset_ms,
            } => {
                if size_ms <= 0 {
                    return Err(ConfigError::InvalidWindowSize(size_ms));
                }
                if period_ms <= 0 || period_ms > size_ms {
                    return Err(ConfigError::InvalidPeriod {
                        period: period_ms,
                        size: size_ms,
                    });
                }
                check_offset(offset_ms, period_ms)
            }
            Self::Session { gap_ms } => {
                if gap_ms <= 0 {
                    return Err(ConfigError::InvalidGap(gap_ms));
                }
                Ok(())
            }
            Self::Global => Ok(()),
        }
    }

    /// Assigns a timestamp to its windows, earliest first.
    #[must_use]
    pub fn assign(&self, timestamp: i64) -> WindowVec {
        let mut windows = WindowVec::new();
        match *self {
            Self::Fixed { size_ms, offset_ms } => {
                let start = aligned_start(timestamp, size_ms, offset_ms);
                windows.push(Window::interval(start, start.saturating_add(size_ms)));
            }
            Self::Sliding {
                size_ms,
                period_ms,
                offset_ms,
            } => {
                // Walk backwards from the last window that could contain this timestamp
                let mut start = aligned_start(timestamp, period_ms, offset_ms);
                loop {
                    let end = start.saturating_add(size_ms);
                    if end <= timestamp {
                        break;
                    }
                    windows.push(Window::interval(start, end));
                    let Some(previous) = start.checked_sub(period_ms) else {
                        break;
                    };
                    start = previous;
                }
                windows.reverse();
            }
            Self::Session { gap_ms } => {
                windows.push(Window::interval(timestamp, timestamp.saturating_add(gap_ms)));
            }
            Self::Global => windows.push(Window::Global),
        }
        windows
    }

    /// Returns true if windows from this assigner must be merged.
    #[must_use]
    pub fn is_merging(&self) -> bool {
        matches!(self, Self::Session { .. })
    }

    /// Returns the distance within which two windows are merged.
    ///
    /// `None` for non-merging assigners.
    #[must_use]
    pub fn merge_slack(&self) -> Option<i64> {
        match *self {
            Self::Session { gap_ms } => Some(gap_ms),
            _ => None,
        }
    }
}

impl Default for WindowAssigner {
    fn default() -> Self {
        Self::Global
    }
}

fn check_offset(offset: i64, bound: i64) -> Result<(), ConfigError> {
    if (0..bound).contains(&offset) {
        Ok(())
    } else {
        Err(ConfigError::InvalidOffset { offset, bound })
    }
}

/// Largest `offset + k * step` that is `<= timestamp` (floor semantics for
/// negative timestamps).
#[inline]
fn aligned_start(timestamp: i64, step: i64, offset: i64) -> i64 {
    let remainder = timestamp.saturating_sub(offset).rem_euclid(step);
    timestamp.saturating_sub(remainder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_assignment() {
        let assigner = WindowAssigner::fixed(60).unwrap();
        assert_eq!(assigner.assign(0).as_slice(), &[Window::interval(0, 60)]);
        assert_eq!(assigner.assign(59).as_slice(), &[Window::interval(0, 60)]);
        assert_eq!(assigner.assign(60).as_slice(), &[Window::interval(60, 120)]);
        assert_eq!(
            assigner.assign(130).as_slice(),
            &[Window::interval(120, 180)]
        );
    }

    #[test]
    fn test_fixed_negative_timestamps() {
        let assigner = WindowAssigner::fixed(1000).unwrap();
        assert_eq!(
            assigner.assign(-1).as_slice(),
            &[Window::interval(-1000, 0)]
        );
        assert_eq!(
            assigner.assign(-1000).as_slice(),
            &[Window::interval(-1000, 0)]
        );
        assert_eq!(
            assigner.assign(-1001).as_slice(),
            &[Window::interval(-2000, -1000)]
        );
    }

    #[test]
    fn test_fixed_every_timestamp_in_exactly_one_window() {
        let size = 7;
        let assigner = WindowAssigner::fixed(size).unwrap();
        for ts in -50..50 {
            let windows = assigner.assign(ts);
            assert_eq!(windows.len(), 1);
            let expected_start = ts.div_euclid(size) * size;
            assert_eq!(
                windows[0],
                Window::interval(expected_start, expected_start + size)
            );
            assert!(windows[0].contains(ts));
        }
    }

    #[test]
    fn test_fixed_with_offset() {
        let assigner = WindowAssigner::fixed_with_offset(60, 15).unwrap();
        assert_eq!(assigner.assign(10).as_slice(), &[Window::interval(-45, 15)]);
        assert_eq!(assigner.assign(15).as_slice(), &[Window::interval(15, 75)]);
    }

    #[test]
    fn test_sliding_assignment() {
        let assigner = WindowAssigner::sliding(60, 20).unwrap();
        let windows = assigner.assign(5);
        assert_eq!(
            windows.as_slice(),
            &[
                Window::interval(-40, 20),
                Window::interval(-20, 40),
                Window::interval(0, 60),
            ]
        );
        for window in &windows {
            assert!(window.contains(5));
        }
    }

    #[test]
    fn test_sliding_equal_size_and_period_is_fixed() {
        let sliding = WindowAssigner::sliding(30, 30).unwrap();
        let fixed = WindowAssigner::fixed(30).unwrap();
        for ts in [-31, -1, 0, 29, 30, 1234] {
            assert_eq!(sliding.assign(ts), fixed.assign(ts));
        }
    }

    #[test]
    fn test_sliding_uneven_period() {
        let assigner = WindowAssigner::sliding(50, 20).unwrap();
        // Windows of length 50 starting at multiples of 20 containing 45
        assert_eq!(
            assigner.assign(45).as_slice(),
            &[Window::interval(0, 50), Window::interval(20, 70), Window::interval(40, 90)]
        );
        assert_eq!(
            assigner.assign(55).as_slice(),
            &[Window::interval(20, 70), Window::interval(40, 90)]
        );
    }

    #[test]
    fn test_session_and_global_assignment() {
        let session = WindowAssigner::session(30).unwrap();
        assert_eq!(session.assign(10).as_slice(), &[Window::interval(10, 40)]);
        assert!(session.is_merging());
        assert_eq!(session.merge_slack(), Some(30));

        let global = WindowAssigner::global();
        assert_eq!(global.assign(i64::MIN).as_slice(), &[Window::Global]);
        assert!(!global.is_merging());
    }

    #[test]
    fn test_invalid_assigners() {
        assert!(matches!(
            WindowAssigner::fixed(0),
            Err(ConfigError::InvalidWindowSize(0))
        ));
        assert!(matches!(
            WindowAssigner::fixed(-5),
            Err(ConfigError::InvalidWindowSize(-5))
        ));
        assert!(matches!(
            WindowAssigner::fixed_with_offset(60, 60),
            Err(ConfigError::InvalidOffset { .. })
        ));
        assert!(matches!(
            WindowAssigner::sliding(20, 30),
            Err(ConfigError::InvalidPeriod { .. })
        ));
        assert!(matches!(
            WindowAssigner::sliding(20, 0),
            Err(ConfigError::InvalidPeriod { .. })
        ));
        assert!(matches!(
            WindowAssigner::session(0),
            Err(ConfigError::InvalidGap(0))
        ));
    }

    #[test]
    fn test_window_bounds() {
        let window = Window::interval(0, 60);
        assert_eq!(window.max_timestamp(), 59);
        assert_eq!(window.gc_time(10), 70);
        assert!(!window.is_expired(10, 69));
        assert!(window.is_expired(10, 70));
        assert!(window.is_expired(0, 60));

        assert_eq!(Window::Global.max_timestamp(), END_OF_GLOBAL_WINDOW);
        assert!(!Window::Global.is_expired(i64::MAX / 2, i64::MAX - 1));
        assert!(Window::Global.is_expired(i64::MAX / 2, i64::MAX));
    }

    #[test]
    fn test_window_span_and_display() {
        let a = Window::interval(0, 30);
        let b = Window::interval(50, 80);
        assert_eq!(a.span(&b), Window::interval(0, 80));
        assert_eq!(a.span(&Window::Global), Window::Global);
        assert_eq!(a.to_string(), "[0, 30)");
    }

    #[test]
    fn test_assigner_serde() {
        let assigner = WindowAssigner::sliding_with_offset(60, 20, 5).unwrap();
        let json = serde_json::to_string(&assigner).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"sliding","size_ms":60,"period_ms":20,"offset_ms":5}"#
        );

        let parsed: WindowAssigner = serde_json::from_str(r#"{"kind":"fixed","size_ms":60}"#).unwrap();
        assert_eq!(parsed, WindowAssigner::fixed(60).unwrap());
    }
}
