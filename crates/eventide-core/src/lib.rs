//! # `Eventide` Core
//!
//! Event-time windowing for keyed aggregation: windows, watermarks, holds,
//! triggers and panes.
//!
//! This crate provides:
//! - **Windows**: Fixed, sliding, session and global window assignment, with merging
//! - **Time**: Watermark tracking, watermark holds and timers
//! - **Triggers**: Composable firing conditions compiled into flat evaluators
//! - **Panes**: Accumulation, aggregation and pane metadata
//! - **State**: Per (key, window) state behind a pluggable store
//! - **Engine**: The group-by-key state machine and a partitioned stage
//!
//! ## Design Principles
//!
//! 1. **Deterministic** - the same inputs in the same order yield the same panes
//! 2. **Atomic** - every operation commits fully or leaves the engine unchanged
//! 3. **Monotonic** - watermarks never move backwards
//! 4. **Bounded state** - every window is collected once lateness has passed
//!
//! ## Example
//!
//! ```rust
//! use eventide_core::engine::{GroupByKeyEngine, WindowingStrategy};
//! use eventide_core::pane::{AccumulationMode, PaneTiming, SumAggregator};
//! use eventide_core::trigger::Trigger;
//! use eventide_core::window::WindowAssigner;
//!
//! # fn main() -> eventide_core::Result<()> {
//! let strategy = WindowingStrategy::new(WindowAssigner::fixed(60)?)
//!     .with_trigger(Trigger::after_end_of_window().with_early_firings(Trigger::after_count(2)))
//!     .with_accumulation_mode(AccumulationMode::Accumulating);
//! let mut engine = GroupByKeyEngine::new(strategy, SumAggregator)?;
//!
//! engine.process_element("sensor-1", 1, 10)?;
//! let early = engine.process_element("sensor-1", 2, 20)?;
//! assert_eq!(early[0].timing(), PaneTiming::Early);
//!
//! engine.process_element("sensor-1", 4, 30)?;
//! let on_time = engine.advance_watermark(60)?;
//! assert_eq!(on_time[0].value, 7);
//! assert_eq!(on_time[0].timing(), PaneTiming::OnTime);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod pane;
pub mod state;
pub mod time;
pub mod trigger;
// rkyv's derived `WindowResolver` has undocumented public fields.
#[allow(missing_docs)]
pub mod window;

// Re-export key types
pub use engine::{
    ClosingBehavior, ConfigError, EngineError, EngineMetrics, GroupByKeyEngine, Input,
    OnTimeBehavior, Record, Stage, StageConfig, StageError, WindowingStrategy,
};
pub use pane::{AccumulationMode, Aggregator, Pane, PaneInfo, PaneTiming};
pub use time::Watermark;
pub use trigger::Trigger;
pub use window::{Window, WindowAssigner};

/// Result type for eventide-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for eventide-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid windowing strategy or stage configuration
    #[error("Config error: {0}")]
    Config(#[from] engine::ConfigError),

    /// Engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Stage errors
    #[error("Stage error: {0}")]
    Stage(#[from] engine::StageError),

    /// State store errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Aggregation errors
    #[error("Aggregate error: {0}")]
    Aggregate(#[from] pane::AggregateError),

    /// Time-related errors
    #[error("Time error: {0}")]
    Time(#[from] time::TimeError),
}
