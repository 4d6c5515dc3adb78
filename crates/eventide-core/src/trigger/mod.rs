//! # Triggers
//!
//! A trigger decides when the buffered contents of a (key, window) are
//! emitted as a pane. Triggers are declared as a tree of primitive and
//! composite nodes; the tree is shared by every window, while each window
//! carries its own [`TriggerState`].
//!
//! ## Primitives
//!
//! - [`Trigger::AfterWatermarkPasses`]: fires once when the input watermark
//!   reaches the window end (optionally plus an offset)
//! - [`Trigger::AfterEndOfWindow`]: the watermark trigger with optional early
//!   and late firings
//! - [`Trigger::AfterElementCount`]: fires once `n` elements have arrived
//! - [`Trigger::AfterProcessingTime`]: fires `delay` after the first element
//! - [`Trigger::Never`]: never fires; the window only closes at expiry
//!
//! ## Composites
//!
//! - [`Trigger::Repeatedly`]: re-arms its child after every firing
//! - [`Trigger::AfterFirst`] / [`Trigger::AfterAll`]: fire when any / all
//!   children are ready
//! - [`Trigger::AfterEach`]: runs children in sequence
//! - [`Trigger::OrFinally`]: behaves as the main trigger until the finishing
//!   trigger fires, which finishes the window
//!
//! ```rust
//! use eventide_core::trigger::Trigger;
//!
//! // Speculative panes every 100 elements, then one on-time pane, then a
//! // late pane for every late element.
//! let trigger = Trigger::after_end_of_window()
//!     .with_early_firings(Trigger::after_count(100))
//!     .with_late_firings(Trigger::after_count(1));
//! assert!(trigger.validate().is_ok());
//!
//! assert!(Trigger::after_all(vec![]).validate().is_err());
//! ```

mod evaluator;
mod state;

pub use evaluator::{TriggerContext, TriggerEvaluator};
pub use state::{NodeData, NodeState, TriggerState};

use serde::{Deserialize, Serialize};

use crate::engine::ConfigError;

/// The watermark position a watermark trigger waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkBoundary {
    /// The end of the window.
    #[default]
    EndOfWindow,
    /// The end of the window plus a non-negative offset in milliseconds.
    EndOfWindowPlus(i64),
}

impl WatermarkBoundary {
    /// Returns the offset past the window end.
    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        match self {
            Self::EndOfWindow => 0,
            Self::EndOfWindowPlus(offset) => *offset,
        }
    }
}

/// Declarative trigger specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fires once when the input watermark reaches the boundary.
    AfterWatermarkPasses(WatermarkBoundary),
    /// Fires when the watermark passes the window end, with optional
    /// early firings before it and late firings after it. The early and
    /// late triggers re-arm after every firing.
    AfterEndOfWindow {
        /// Trigger for speculative panes before the window end
        #[serde(default)]
        early: Option<Box<Trigger>>,
        /// Trigger for late panes after the window end
        #[serde(default)]
        late: Option<Box<Trigger>>,
    },
    /// Fires once the given number of elements has arrived.
    AfterElementCount(u64),
    /// Fires once the processing clock passes the first element's arrival
    /// time plus the given delay in milliseconds.
    AfterProcessingTime(i64),
    /// Never fires.
    Never,
    /// Re-arms the child after every firing. Never finishes.
    Repeatedly(Box<Trigger>),
    /// Fires when any child fires, then finishes.
    AfterFirst(Vec<Trigger>),
    /// Fires when every child has fired, then finishes.
    AfterAll(Vec<Trigger>),
    /// Runs each child to completion in order.
    AfterEach(Vec<Trigger>),
    /// Behaves as the first trigger; a firing of the second finishes.
    OrFinally(Box<Trigger>, Box<Trigger>),
}

impl Default for Trigger {
    fn default() -> Self {
        Self::AfterWatermarkPasses(WatermarkBoundary::EndOfWindow)
    }
}

impl Trigger {
    /// Fires once when the watermark passes the window end.
    #[must_use]
    pub fn after_watermark() -> Self {
        Self::AfterWatermarkPasses(WatermarkBoundary::EndOfWindow)
    }

    /// Fires once when the watermark passes the window end plus `offset_ms`.
    #[must_use]
    pub fn after_watermark_plus(offset_ms: i64) -> Self {
        Self::AfterWatermarkPasses(WatermarkBoundary::EndOfWindowPlus(offset_ms))
    }

    /// End-of-window trigger without early or late firings.
    #[must_use]
    pub fn after_end_of_window() -> Self {
        Self::AfterEndOfWindow {
            early: None,
            late: None,
        }
    }

    /// Fires once `n` elements have arrived.
    #[must_use]
    pub fn after_count(n: u64) -> Self {
        Self::AfterElementCount(n)
    }

    /// Fires `delay_ms` of processing time after the first element.
    #[must_use]
    pub fn after_processing_time(delay_ms: i64) -> Self {
        Self::AfterProcessingTime(delay_ms)
    }

    /// Re-arms `trigger` after every firing.
    #[must_use]
    pub fn repeatedly(trigger: Trigger) -> Self {
        Self::Repeatedly(Box::new(trigger))
    }

    /// Fires when any of `triggers` fires.
    #[must_use]
    pub fn after_first(triggers: Vec<Trigger>) -> Self {
        Self::AfterFirst(triggers)
    }

    /// Fires when all of `triggers` have fired.
    #[must_use]
    pub fn after_all(triggers: Vec<Trigger>) -> Self {
        Self::AfterAll(triggers)
    }

    /// Runs `triggers` in sequence.
    #[must_use]
    pub fn after_each(triggers: Vec<Trigger>) -> Self {
        Self::AfterEach(triggers)
    }

    /// Finishes as soon as `finally` fires.
    #[must_use]
    pub fn or_finally(self, finally: Trigger) -> Self {
        Self::OrFinally(Box::new(self), Box::new(finally))
    }

    /// Adds early firings to an end-of-window trigger.
    ///
    /// Any other trigger is first turned into a plain end-of-window trigger.
    #[must_use]
    pub fn with_early_firings(self, early_trigger: Trigger) -> Self {
        let late = match self {
            Self::AfterEndOfWindow { late, .. } => late,
            _ => None,
        };
        Self::AfterEndOfWindow {
            early: Some(Box::new(early_trigger)),
            late,
        }
    }

    /// Adds late firings to an end-of-window trigger.
    ///
    /// Any other trigger is first turned into a plain end-of-window trigger.
    #[must_use]
    pub fn with_late_firings(self, late_trigger: Trigger) -> Self {
        let early = match self {
            Self::AfterEndOfWindow { early, .. } => early,
            _ => None,
        };
        Self::AfterEndOfWindow {
            early,
            late: Some(Box::new(late_trigger)),
        }
    }

    /// Checks the trigger tree for construction-time errors.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::EmptyComposite`] for a composite without children
    /// - [`ConfigError::ZeroElementCount`] for `AfterElementCount(0)`
    /// - [`ConfigError::NegativeDelay`] for a negative processing-time delay
    /// - [`ConfigError::NegativeWatermarkOffset`] for a negative boundary offset
    /// - [`ConfigError::FinallyCannotFinish`] if an `OrFinally` finishing
    ///   trigger can never finish
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::AfterWatermarkPasses(boundary) => {
                let offset = boundary.offset_ms();
                if offset < 0 {
                    return Err(ConfigError::NegativeWatermarkOffset(offset));
                }
                Ok(())
            }
            Self::AfterEndOfWindow { early, late } => {
                if let Some(early) = early {
                    early.validate()?;
                }
                if let Some(late) = late {
                    late.validate()?;
                }
                Ok(())
            }
            Self::AfterElementCount(0) => Err(ConfigError::ZeroElementCount),
            Self::AfterElementCount(_) | Self::Never => Ok(()),
            Self::AfterProcessingTime(delay) => {
                if *delay < 0 {
                    return Err(ConfigError::NegativeDelay(*delay));
                }
                Ok(())
            }
            Self::Repeatedly(child) => child.validate(),
            Self::AfterFirst(children) | Self::AfterAll(children) | Self::AfterEach(children) => {
                if children.is_empty() {
                    return Err(ConfigError::EmptyComposite(self.name()));
                }
                children.iter().try_for_each(Trigger::validate)
            }
            Self::OrFinally(main, finally) => {
                main.validate()?;
                finally.validate()?;
                if !finally.may_finish() {
                    return Err(ConfigError::FinallyCannotFinish);
                }
                Ok(())
            }
        }
    }

    /// Returns true if the trigger can ever finish.
    #[must_use]
    pub fn may_finish(&self) -> bool {
        match self {
            Self::AfterWatermarkPasses(_)
            | Self::AfterElementCount(_)
            | Self::AfterProcessingTime(_) => true,
            Self::AfterEndOfWindow { late, .. } => late.is_none(),
            Self::Never | Self::Repeatedly(_) => false,
            Self::AfterFirst(children) => children.iter().any(Trigger::may_finish),
            Self::AfterAll(children) | Self::AfterEach(children) => {
                children.iter().all(Trigger::may_finish)
            }
            Self::OrFinally(main, finally) => main.may_finish() || finally.may_finish(),
        }
    }

    /// Returns the name of the trigger kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AfterWatermarkPasses(_) => "AfterWatermarkPasses",
            Self::AfterEndOfWindow { .. } => "AfterEndOfWindow",
            Self::AfterElementCount(_) => "AfterElementCount",
            Self::AfterProcessingTime(_) => "AfterProcessingTime",
            Self::Never => "Never",
            Self::Repeatedly(_) => "Repeatedly",
            Self::AfterFirst(_) => "AfterFirst",
            Self::AfterAll(_) => "AfterAll",
            Self::AfterEach(_) => "AfterEach",
            Self::OrFinally(..) => "OrFinally",
        }
    }
}

/// Outcome of evaluating a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    /// Nothing to emit.
    Continue,
    /// Emit a pane; the window stays open.
    Fire,
    /// Emit the final pane; the window becomes terminal.
    FireAndFinish,
}

impl TriggerResult {
    /// Returns true if a pane should be emitted.
    #[must_use]
    pub fn is_fire(self) -> bool {
        !matches!(self, Self::Continue)
    }

    /// Returns true if the trigger finished.
    #[must_use]
    pub fn is_finish(self) -> bool {
        matches!(self, Self::FireAndFinish)
    }
}
