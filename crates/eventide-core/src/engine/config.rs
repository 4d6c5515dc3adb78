//! Static configuration of a grouping operation.
//!
//! Everything here is a plain value: it derives `serde` so a runner can load
//! it from any format, and [`WindowingStrategy::validate`] reports every
//! construction-time error before an engine exists.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pane::AccumulationMode;
use crate::time::duration_millis;
use crate::trigger::{Trigger, TriggerEvaluator};
use crate::window::WindowAssigner;

/// Whether a window emits a final pane when it closes without pending data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingBehavior {
    /// Emit a final pane only if there is data since the last pane.
    #[default]
    FireIfNonEmpty,
    /// Always emit a final pane, possibly empty.
    FireAlways,
}

/// Whether an ON_TIME firing without new data still produces a pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeBehavior {
    /// Skip the ON_TIME pane if nothing arrived since the last pane.
    #[default]
    FireIfNonEmpty,
    /// Always emit the ON_TIME pane.
    FireAlways,
}

fn default_sources() -> usize {
    1
}

/// How a grouping operation windows, triggers and accumulates.
///
/// # Example
///
/// ```rust
/// use eventide_core::engine::WindowingStrategy;
/// use eventide_core::pane::AccumulationMode;
/// use eventide_core::trigger::Trigger;
/// use eventide_core::window::WindowAssigner;
///
/// let strategy = WindowingStrategy::new(WindowAssigner::fixed(60_000).unwrap())
///     .with_trigger(Trigger::after_end_of_window().with_early_firings(Trigger::after_count(100)))
///     .with_allowed_lateness_ms(5_000)
///     .with_accumulation_mode(AccumulationMode::Accumulating);
///
/// assert!(strategy.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowingStrategy {
    /// Window assignment
    pub assigner: WindowAssigner,
    /// When panes are emitted
    #[serde(default)]
    pub trigger: Trigger,
    /// How long past a window's end late data is still accepted
    #[serde(default)]
    pub allowed_lateness_ms: i64,
    /// Discarding or accumulating panes
    #[serde(default)]
    pub accumulation_mode: AccumulationMode,
    /// Final pane policy when a window closes
    #[serde(default)]
    pub closing_behavior: ClosingBehavior,
    /// ON_TIME pane policy
    #[serde(default)]
    pub on_time_behavior: OnTimeBehavior,
    /// Number of upstream watermark sources
    #[serde(default = "default_sources")]
    pub upstream_sources: usize,
}

impl WindowingStrategy {
    /// Creates a strategy with the default trigger, no lateness and
    /// discarding panes.
    #[must_use]
    pub fn new(assigner: WindowAssigner) -> Self {
        Self {
            assigner,
            trigger: Trigger::default(),
            allowed_lateness_ms: 0,
            accumulation_mode: AccumulationMode::Discarding,
            closing_behavior: ClosingBehavior::FireIfNonEmpty,
            on_time_behavior: OnTimeBehavior::FireIfNonEmpty,
            upstream_sources: 1,
        }
    }

    /// Sets the trigger.
    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Sets the allowed lateness in milliseconds.
    #[must_use]
    pub fn with_allowed_lateness_ms(mut self, lateness_ms: i64) -> Self {
        self.allowed_lateness_ms = lateness_ms;
        self
    }

    /// Sets the allowed lateness, saturating at `i64::MAX` milliseconds.
    #[must_use]
    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness_ms = duration_millis(lateness).unwrap_or(i64::MAX);
        self
    }

    /// Sets the accumulation mode.
    #[must_use]
    pub fn with_accumulation_mode(mut self, mode: AccumulationMode) -> Self {
        self.accumulation_mode = mode;
        self
    }

    /// Sets the closing behavior.
    #[must_use]
    pub fn with_closing_behavior(mut self, behavior: ClosingBehavior) -> Self {
        self.closing_behavior = behavior;
        self
    }

    /// Sets the ON_TIME behavior.
    #[must_use]
    pub fn with_on_time_behavior(mut self, behavior: OnTimeBehavior) -> Self {
        self.on_time_behavior = behavior;
        self
    }

    /// Sets the number of upstream watermark sources.
    #[must_use]
    pub fn with_upstream_sources(mut self, sources: usize) -> Self {
        self.upstream_sources = sources;
        self
    }

    /// Checks every construction-time constraint.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found in the assigner, the trigger,
    /// the lateness or the source count.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.assigner.validate()?;
        self.trigger.validate()?;
        if self.allowed_lateness_ms < 0 {
            return Err(ConfigError::NegativeLateness(self.allowed_lateness_ms));
        }
        if self.upstream_sources == 0 {
            return Err(ConfigError::NoSources);
        }
        Ok(())
    }

    /// Validates the strategy and compiles its trigger.
    pub(crate) fn compile(&self) -> Result<TriggerEvaluator, ConfigError> {
        self.validate()?;
        TriggerEvaluator::new(&self.trigger)
    }
}

/// Configuration of a partitioned [`Stage`](super::Stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, used in log fields
    pub name: String,
    /// Number of key partitions processed in parallel
    pub partitions: usize,
}

impl StageConfig {
    /// Creates a stage configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, partitions: usize) -> Self {
        Self {
            name: name.into(),
            partitions,
        }
    }

    /// Checks the partition count.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoPartitions`] if `partitions` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::NoPartitions);
        }
        Ok(())
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::new("group_by_key", 1)
    }
}

/// Construction-time configuration errors. These are fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Window size must be positive
    #[error("Invalid window size: {0}ms (must be > 0)")]
    InvalidWindowSize(i64),

    /// Sliding period must be positive and not exceed the size
    #[error("Invalid sliding period: {period}ms for size {size}ms")]
    InvalidPeriod {
        /// Configured period
        period: i64,
        /// Configured size
        size: i64,
    },

    /// Window offset out of range
    #[error("Invalid window offset: {offset}ms (must be in [0, {bound}))")]
    InvalidOffset {
        /// Configured offset
        offset: i64,
        /// Exclusive upper bound
        bound: i64,
    },

    /// Session gap must be positive
    #[error("Invalid session gap: {0}ms (must be > 0)")]
    InvalidGap(i64),

    /// Allowed lateness must not be negative
    #[error("Negative allowed lateness: {0}ms")]
    NegativeLateness(i64),

    /// Composite trigger without children
    #[error("{0} trigger requires at least one child")]
    EmptyComposite(&'static str),

    /// Element count trigger with n = 0
    #[error("Element count trigger requires n >= 1")]
    ZeroElementCount,

    /// Processing-time trigger with a negative delay
    #[error("Negative processing-time delay: {0}ms")]
    NegativeDelay(i64),

    /// Watermark trigger with a negative offset past the window end
    #[error("Negative watermark offset: {0}ms")]
    NegativeWatermarkOffset(i64),

    /// `OrFinally` whose finishing trigger can never finish
    #[error("OrFinally finishing trigger can never finish")]
    FinallyCannotFinish,

    /// A stage needs at least one upstream source
    #[error("At least one upstream source is required")]
    NoSources,

    /// A stage needs at least one partition
    #[error("At least one partition is required")]
    NoPartitions,
}
