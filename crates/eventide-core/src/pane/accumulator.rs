//! Buffered aggregate of one (key, window).

use super::{AccumulationMode, AggregateError, Aggregator, PaneInfo, PaneTiming};
use crate::window::Window;

/// What caused a trigger check that produced a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringKind {
    /// An element arrived for the window.
    Element,
    /// The input watermark advanced (trigger timers or expiry).
    Watermark,
    /// The processing clock advanced.
    ProcessingTime,
}

/// Owns the aggregate buffered for a (key, window) and the pane sequence.
///
/// # Example
///
/// ```rust
/// use eventide_core::pane::{
///     AccumulationMode, FiringKind, PaneAccumulator, PaneTiming, SumAggregator,
/// };
/// use eventide_core::window::Window;
///
/// let window = Window::interval(0, 60);
/// let mut pane = PaneAccumulator::new(0i64);
/// pane.add_input(&SumAggregator, 5).unwrap();
///
/// let timing = pane.classify(&window, 60, FiringKind::Watermark);
/// assert_eq!(timing, PaneTiming::OnTime);
///
/// let (value, info) = pane
///     .fire(&SumAggregator, timing, true, AccumulationMode::Discarding)
///     .unwrap();
/// assert_eq!(value, 5);
/// assert_eq!(info.index, 0);
/// assert!(info.is_last);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PaneAccumulator<Acc> {
    acc: Acc,
    /// Elements added since the last pane
    pending: u64,
    /// Elements currently held in `acc`
    buffered: u64,
    next_index: u64,
    /// Number of ON_TIME and LATE panes emitted
    non_speculative: i64,
}

impl<Acc: Clone> PaneAccumulator<Acc> {
    /// Creates an accumulator around an empty aggregate.
    #[must_use]
    pub fn new(acc: Acc) -> Self {
        Self {
            acc,
            pending: 0,
            buffered: 0,
            next_index: 0,
            non_speculative: 0,
        }
    }

    /// Adds one element to the aggregate.
    ///
    /// # Errors
    ///
    /// Propagates the aggregator's [`AggregateError`].
    pub fn add_input<A>(&mut self, aggregator: &A, input: A::Input) -> Result<(), AggregateError>
    where
        A: Aggregator<Acc = Acc> + ?Sized,
    {
        aggregator.add_input(&mut self.acc, input)?;
        self.pending += 1;
        self.buffered += 1;
        Ok(())
    }

    /// Absorbs the accumulator of a window merged into this one.
    ///
    /// Pane numbering continues from the furthest-advanced source so no
    /// index is reused.
    ///
    /// # Errors
    ///
    /// Propagates the aggregator's [`AggregateError`].
    pub fn merge_from<A>(&mut self, aggregator: &A, other: Self) -> Result<(), AggregateError>
    where
        A: Aggregator<Acc = Acc> + ?Sized,
    {
        aggregator.merge_accumulators(&mut self.acc, other.acc)?;
        self.pending += other.pending;
        self.buffered += other.buffered;
        self.next_index = self.next_index.max(other.next_index);
        self.non_speculative = self.non_speculative.max(other.non_speculative);
        Ok(())
    }

    /// Returns true if elements arrived since the last pane.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending > 0
    }

    /// Returns the number of elements added since the last pane.
    #[must_use]
    pub fn pending_elements(&self) -> u64 {
        self.pending
    }

    /// Returns the number of elements held in the aggregate.
    #[must_use]
    pub fn buffered_elements(&self) -> u64 {
        self.buffered
    }

    /// Returns the number of panes emitted so far.
    #[must_use]
    pub fn panes_emitted(&self) -> u64 {
        self.next_index
    }

    /// Returns the buffered aggregate.
    #[must_use]
    pub fn accumulator(&self) -> &Acc {
        &self.acc
    }

    /// Classifies a firing of `window` at input watermark `watermark`.
    ///
    /// EARLY while the watermark has not passed the window's max timestamp;
    /// ON_TIME for the first non-early pane caused by the watermark; LATE
    /// otherwise.
    #[must_use]
    pub fn classify(&self, window: &Window, watermark: i64, cause: FiringKind) -> PaneTiming {
        if watermark <= window.max_timestamp() {
            PaneTiming::Early
        } else if cause == FiringKind::Watermark && self.non_speculative == 0 {
            PaneTiming::OnTime
        } else {
            PaneTiming::Late
        }
    }

    /// Produces the next pane.
    ///
    /// In [`AccumulationMode::Discarding`] the aggregate is reset afterwards.
    /// Nothing changes if extracting the value fails.
    ///
    /// # Errors
    ///
    /// Propagates the aggregator's [`AggregateError`].
    pub fn fire<A>(
        &mut self,
        aggregator: &A,
        timing: PaneTiming,
        is_last: bool,
        mode: AccumulationMode,
    ) -> Result<(A::Output, PaneInfo), AggregateError>
    where
        A: Aggregator<Acc = Acc> + ?Sized,
    {
        let value = aggregator.extract_output(&self.acc)?;
        let non_speculative_index = if timing == PaneTiming::Early {
            -1
        } else {
            let index = self.non_speculative;
            self.non_speculative += 1;
            index
        };
        let info = PaneInfo {
            index: self.next_index,
            non_speculative_index,
            is_first: self.next_index == 0,
            is_last,
            timing,
        };

        self.next_index += 1;
        self.pending = 0;
        if mode == AccumulationMode::Discarding {
            self.acc = aggregator.create_accumulator();
            self.buffered = 0;
        }
        Ok((value, info))
    }
}
