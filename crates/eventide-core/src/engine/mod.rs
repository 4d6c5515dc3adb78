//! # Grouping Engine
//!
//! [`GroupByKeyEngine`] groups keyed, timestamped elements into windows and
//! decides when each (key, window) emits a pane.
//!
//! ## State machine
//!
//! Each (key, window) is `OPEN` from its first element, becomes `TERMINAL`
//! when its trigger finishes, and is destroyed once the input watermark
//! passes its garbage-collection time (`max_timestamp + allowed_lateness`).
//! A window that is still open at that point is force-closed with a final
//! ON_TIME or LATE pane if it holds unfired data.
//!
//! ## Units of work
//!
//! Every public operation is atomic. Changes to window state, merge logs,
//! holds, timers, the watermark tracker and the metrics are journaled, and
//! a failure (for example an aggregation error) rolls all of them back
//! before the error is returned. No pane is returned from a failed
//! operation, so retrying it is exact.
//!
//! ## Example
//!
//! ```rust
//! use eventide_core::engine::{GroupByKeyEngine, WindowingStrategy};
//! use eventide_core::pane::{PaneTiming, SumAggregator};
//! use eventide_core::window::{Window, WindowAssigner};
//!
//! let strategy = WindowingStrategy::new(WindowAssigner::fixed(60).unwrap());
//! let mut engine = GroupByKeyEngine::new(strategy, SumAggregator).unwrap();
//!
//! assert!(engine.process_element("k", 2, 10).unwrap().is_empty());
//! assert!(engine.process_element("k", 3, 20).unwrap().is_empty());
//!
//! let panes = engine.advance_watermark(60).unwrap();
//! assert_eq!(panes.len(), 1);
//! assert_eq!(panes[0].window, Window::interval(0, 60));
//! assert_eq!(panes[0].value, 5);
//! assert_eq!(panes[0].timing(), PaneTiming::OnTime);
//! assert!(panes[0].is_last());
//! ```

mod config;
mod metrics;
mod stage;
mod txn;

pub use config::{ClosingBehavior, ConfigError, OnTimeBehavior, StageConfig, WindowingStrategy};
pub use metrics::EngineMetrics;
pub use stage::{Stage, StageError};

use std::fmt::Debug;
use std::hash::Hash;

use fxhash::FxHashMap;
use smallvec::smallvec;
use tracing::{debug, error, trace, warn};

use crate::pane::{AggregateError, Aggregator, FiringKind, Pane, PaneAccumulator, PaneTiming};
use crate::state::{InMemoryWindowStore, KeyedWindowState, StateError, WindowStatus, WindowStore};
use crate::time::{
    FiredTimers, TimeDomain, TimeError, TimerService, Watermark, WatermarkMetrics,
    WatermarkTracker,
};
use crate::trigger::{TriggerContext, TriggerEvaluator, TriggerResult, TriggerState};
use crate::window::{merge_windows, Window, WindowVec};
use txn::{Checkpoint, MergeLog, UndoEntry, UndoLog};

/// A keyed, timestamped element.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<K, V> {
    /// Grouping key
    pub key: K,
    /// Element value
    pub value: V,
    /// Event timestamp in milliseconds
    pub timestamp: i64,
    /// Windows assigned upstream; empty to use the strategy's assigner
    pub windows: WindowVec,
}

impl<K, V> Record<K, V> {
    /// Creates a record whose windows are assigned by the engine.
    #[must_use]
    pub fn new(key: K, value: V, timestamp: i64) -> Self {
        Self {
            key,
            value,
            timestamp,
            windows: WindowVec::new(),
        }
    }

    /// Attaches windows assigned upstream.
    #[must_use]
    pub fn with_windows(mut self, windows: WindowVec) -> Self {
        self.windows = windows;
        self
    }
}

/// One input event of a bundle.
#[derive(Debug, Clone, PartialEq)]
pub enum Input<K, V> {
    /// An element to group
    Element(Record<K, V>),
    /// A new watermark from an upstream source
    Watermark {
        /// Upstream source index
        source: usize,
        /// Reported watermark
        watermark: i64,
    },
    /// An upstream source went idle
    SourceIdle(usize),
    /// The processing clock advanced
    ProcessingTime(i64),
}

/// Errors that fail a unit of work. The engine state is rolled back.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Aggregation logic failed
    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),

    /// The window store rejected a change
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Invalid time input (e.g. unknown watermark source)
    #[error("Time error: {0}")]
    Time(#[from] TimeError),
}

/// Group-by-key with windowing, triggers and watermark holds.
///
/// `S` is the window store; it defaults to [`InMemoryWindowStore`].
pub struct GroupByKeyEngine<K, A, S = InMemoryWindowStore<K, <A as Aggregator>::Acc>>
where
    A: Aggregator,
{
    strategy: WindowingStrategy,
    aggregator: A,
    evaluator: TriggerEvaluator,
    store: S,
    timers: TimerService<K>,
    tracker: WatermarkTracker,
    /// Per key: merged-away window -> live window it was merged into
    merge_logs: FxHashMap<K, MergeLog>,
    processing_time: i64,
    metrics: EngineMetrics,
    undo: UndoLog<K, A::Acc>,
}

impl<K, A> GroupByKeyEngine<K, A>
where
    K: Clone + Eq + Hash + Debug + Send,
    A: Aggregator,
    A::Input: Clone,
{
    /// Creates an engine with an in-memory window store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the strategy is invalid.
    pub fn new(strategy: WindowingStrategy, aggregator: A) -> Result<Self, ConfigError> {
        Self::with_store(strategy, aggregator, InMemoryWindowStore::new())
    }
}

impl<K, A, S> GroupByKeyEngine<K, A, S>
where
    K: Clone + Eq + Hash + Debug + Send,
    A: Aggregator,
    A::Input: Clone,
    S: WindowStore<K, A::Acc>,
{
    /// Creates an engine over the given window store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the strategy is invalid.
    pub fn with_store(
        strategy: WindowingStrategy,
        aggregator: A,
        store: S,
    ) -> Result<Self, ConfigError> {
        let evaluator = strategy.compile()?;
        let tracker = WatermarkTracker::new(strategy.upstream_sources);
        Ok(Self {
            strategy,
            aggregator,
            evaluator,
            store,
            timers: TimerService::new(),
            tracker,
            merge_logs: FxHashMap::default(),
            processing_time: 0,
            metrics: EngineMetrics::new(),
            undo: UndoLog::default(),
        })
    }

    /// Processes one element, assigning its windows with the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if aggregation or storage fails; the engine is
    /// left unchanged.
    pub fn process_element(
        &mut self,
        key: K,
        value: A::Input,
        timestamp: i64,
    ) -> Result<Vec<Pane<K, A::Output>>, EngineError> {
        self.process_record(Record::new(key, value, timestamp))
    }

    /// Processes one record, honoring windows assigned upstream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if aggregation or storage fails; the engine is
    /// left unchanged.
    pub fn process_record(
        &mut self,
        record: Record<K, A::Input>,
    ) -> Result<Vec<Pane<K, A::Output>>, EngineError> {
        self.atomically(|engine, out| engine.apply(Input::Element(record), out))
    }

    /// Processes a bundle of inputs as a single unit of work.
    ///
    /// # Errors
    ///
    /// Returns the first [`EngineError`]; no input of the bundle is applied.
    pub fn process_bundle<I>(&mut self, inputs: I) -> Result<Vec<Pane<K, A::Output>>, EngineError>
    where
        I: IntoIterator<Item = Input<K, A::Input>>,
    {
        self.atomically(|engine, out| {
            inputs
                .into_iter()
                .try_for_each(|input| engine.apply(input, out))
        })
    }

    /// Advances the watermark of source 0.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if a resulting firing fails.
    pub fn advance_watermark(
        &mut self,
        watermark: i64,
    ) -> Result<Vec<Pane<K, A::Output>>, EngineError> {
        self.advance_source_watermark(0, watermark)
    }

    /// Advances the watermark of one upstream source.
    ///
    /// A value below the source's current watermark is rejected and counted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Time`] for an unknown source, or any error of a
    /// resulting firing.
    pub fn advance_source_watermark(
        &mut self,
        source: usize,
        watermark: i64,
    ) -> Result<Vec<Pane<K, A::Output>>, EngineError> {
        self.atomically(|engine, out| engine.apply(Input::Watermark { source, watermark }, out))
    }

    /// Marks an upstream source idle so it no longer holds back the input
    /// watermark.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Time`] for an unknown source, or any error of a
    /// resulting firing.
    pub fn mark_source_idle(
        &mut self,
        source: usize,
    ) -> Result<Vec<Pane<K, A::Output>>, EngineError> {
        self.atomically(|engine, out| engine.apply(Input::SourceIdle(source), out))
    }

    /// Advances the processing clock, firing due processing-time timers.
    ///
    /// The clock never moves backwards; earlier values are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if a resulting firing fails.
    pub fn advance_processing_time(
        &mut self,
        now: i64,
    ) -> Result<Vec<Pane<K, A::Output>>, EngineError> {
        self.atomically(|engine, out| engine.apply(Input::ProcessingTime(now), out))
    }

    /// Declares the input exhausted: every source advances to
    /// [`Watermark::MAX`], which fires and collects every window.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if a final firing fails.
    pub fn finish(&mut self) -> Result<Vec<Pane<K, A::Output>>, EngineError> {
        self.atomically(Self::flush)
    }

    /// Returns the input watermark.
    #[must_use]
    pub fn input_watermark(&self) -> Watermark {
        self.tracker.input_watermark()
    }

    /// Returns the output watermark published downstream.
    #[must_use]
    pub fn output_watermark(&self) -> Watermark {
        self.tracker.output_watermark()
    }

    /// Returns the engine counters.
    #[must_use]
    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            regressions_rejected: self.tracker.metrics().regressions_rejected,
            ..self.metrics
        }
    }

    /// Returns the watermark counters.
    #[must_use]
    pub fn watermark_metrics(&self) -> &WatermarkMetrics {
        self.tracker.metrics()
    }

    /// Returns the number of elements buffered across all windows.
    ///
    /// Runners use this as a backpressure signal.
    #[must_use]
    pub fn buffered_elements(&self) -> u64 {
        self.store.buffered_elements()
    }

    /// Returns the number of live (key, window) states.
    #[must_use]
    pub fn active_windows(&self) -> usize {
        self.store.window_count()
    }

    /// Returns the live windows of a key.
    #[must_use]
    pub fn windows(&self, key: &K) -> WindowVec {
        self.store.windows(key)
    }

    /// Returns the state of a (key, window).
    #[must_use]
    pub fn window_state(&self, key: &K, window: &Window) -> Option<&KeyedWindowState<A::Acc>> {
        self.store.get(key, window)
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.pending_count()
    }

    /// Returns the processing clock.
    #[must_use]
    pub fn processing_time(&self) -> i64 {
        self.processing_time
    }

    /// Returns the windowing strategy.
    #[must_use]
    pub fn strategy(&self) -> &WindowingStrategy {
        &self.strategy
    }

    fn atomically<F>(&mut self, f: F) -> Result<Vec<Pane<K, A::Output>>, EngineError>
    where
        F: FnOnce(&mut Self, &mut Vec<Pane<K, A::Output>>) -> Result<(), EngineError>,
    {
        self.begin();
        let mut panes = Vec::new();
        match f(self, &mut panes) {
            Ok(()) => {
                self.commit();
                Ok(panes)
            }
            Err(err) => {
                self.rollback();
                warn!(error = %err, "unit of work failed, state rolled back");
                Err(err)
            }
        }
    }

    /// Opens a unit of work.
    pub(crate) fn begin(&mut self) {
        self.undo.begin(Checkpoint {
            tracker: self.tracker.snapshot(),
            metrics: self.metrics,
            processing_time: self.processing_time,
        });
    }

    /// Keeps every change of the open unit of work.
    pub(crate) fn commit(&mut self) {
        self.undo.commit();
    }

    /// Undoes every change of the open unit of work.
    pub(crate) fn rollback(&mut self) {
        let (entries, checkpoint) = self.undo.take();
        for entry in entries {
            match entry {
                UndoEntry::State { key, window, before } => match before {
                    Some(state) => {
                        if let Err(err) = self.store.put(key, window, state) {
                            error!(%window, error = %err, "failed to restore window state");
                        }
                    }
                    None => {
                        self.store.remove(&key, &window);
                    }
                },
                UndoEntry::MergeLog { key, before } => match before {
                    Some(log) => {
                        self.merge_logs.insert(key, log);
                    }
                    None => {
                        self.merge_logs.remove(&key);
                    }
                },
                UndoEntry::HoldAdded(timestamp) => {
                    self.tracker.release_hold(timestamp);
                }
                UndoEntry::HoldReleased(timestamp) => self.tracker.set_hold(timestamp),
                UndoEntry::TimerAdded {
                    key,
                    window,
                    domain,
                    timestamp,
                } => {
                    self.timers.cancel(&key, &window, domain, timestamp);
                }
                UndoEntry::TimersRemoved { key, window, timers } => {
                    for (domain, timestamp) in timers {
                        self.timers.register(key.clone(), window, domain, timestamp);
                    }
                }
            }
        }
        if let Some(checkpoint) = checkpoint {
            self.tracker.restore(checkpoint.tracker);
            self.metrics = checkpoint.metrics;
            self.processing_time = checkpoint.processing_time;
        }
    }

    /// Applies one input inside the open unit of work.
    pub(crate) fn apply(
        &mut self,
        input: Input<K, A::Input>,
        out: &mut Vec<Pane<K, A::Output>>,
    ) -> Result<(), EngineError> {
        let start = out.len();
        match input {
            Input::Element(record) => self.ingest(record, out)?,
            Input::Watermark { source, watermark } => {
                if self.tracker.update_source(source, watermark)?.is_some() {
                    self.on_watermark(out)?;
                }
            }
            Input::SourceIdle(source) => {
                if self.tracker.mark_idle(source)?.is_some() {
                    self.on_watermark(out)?;
                }
            }
            Input::ProcessingTime(now) => self.on_processing_time(now, out)?,
        }
        self.stamp(&mut out[start..]);
        Ok(())
    }

    /// Advances every source to [`Watermark::MAX`] inside the open unit of
    /// work.
    pub(crate) fn flush(&mut self, out: &mut Vec<Pane<K, A::Output>>) -> Result<(), EngineError> {
        let start = out.len();
        for source in 0..self.tracker.num_sources() {
            self.tracker.update_source(source, i64::MAX)?;
        }
        self.on_watermark(out)?;
        self.stamp(&mut out[start..]);
        Ok(())
    }

    /// Refreshes the output watermark and annotates new panes with it.
    fn stamp(&mut self, panes: &mut [Pane<K, A::Output>]) {
        self.tracker.refresh_output();
        let watermark = self.tracker.output_watermark();
        for pane in panes {
            pane.watermark = watermark;
        }
    }

    fn ingest(
        &mut self,
        record: Record<K, A::Input>,
        out: &mut Vec<Pane<K, A::Output>>,
    ) -> Result<(), EngineError> {
        let Record {
            key,
            value,
            timestamp,
            windows,
        } = record;
        self.metrics.elements_processed += 1;

        let watermark = self.tracker.input_watermark().timestamp();
        let lateness = self.strategy.allowed_lateness_ms;
        let merging = self.strategy.assigner.is_merging();
        let assigned = if windows.is_empty() {
            self.strategy.assigner.assign(timestamp)
        } else {
            windows
        };

        let mut targets = WindowVec::new();
        for window in assigned {
            let window = if merging {
                self.resolve(&key, window)
            } else {
                window
            };
            if window.is_expired(lateness, watermark) {
                self.metrics.dropped_expired += 1;
                trace!(?key, %window, timestamp, watermark, "dropped element for expired window");
                continue;
            }
            if self.store.get(&key, &window).is_none() {
                self.create_window(&key, window)?;
            }
            let target = if merging {
                self.merge_key_windows(&key)?;
                self.resolve(&key, window)
            } else {
                window
            };
            if !targets.contains(&target) {
                targets.push(target);
            }
        }

        for window in targets {
            self.add_to_window(&key, window, value.clone(), timestamp, out)?;
        }
        Ok(())
    }

    fn add_to_window(
        &mut self,
        key: &K,
        window: Window,
        value: A::Input,
        timestamp: i64,
        out: &mut Vec<Pane<K, A::Output>>,
    ) -> Result<(), EngineError> {
        let ctx = self.context(window);
        let hold = timestamp.max(self.tracker.output_watermark().timestamp());

        self.undo.record_state(&self.store, key, &window);
        let Some(state) = self.store.get_mut(key, &window) else {
            return Ok(());
        };
        if state.is_terminal() {
            self.metrics.dropped_closed += 1;
            trace!(?key, %window, timestamp, "dropped element for closed window");
            return Ok(());
        }

        state.pane.add_input(&self.aggregator, value)?;
        self.evaluator.on_element(&mut state.trigger, &ctx);
        let result = self.evaluator.evaluate(&mut state.trigger, &ctx);

        let previous_hold = state.hold;
        let lowers_hold = match previous_hold {
            Some(current) => hold < current,
            None => true,
        };
        if lowers_hold {
            state.hold = Some(hold);
            if let Some(current) = previous_hold {
                self.release_hold(current);
            }
            self.set_hold(hold);
        }

        self.register_trigger_timers(key, window);
        if result.is_fire() {
            self.fire(key, window, result, FiringKind::Element, out)?;
        }
        Ok(())
    }

    fn on_watermark(&mut self, out: &mut Vec<Pane<K, A::Output>>) -> Result<(), EngineError> {
        let watermark = self.tracker.input_watermark().timestamp();
        let fired = self.timers.poll(TimeDomain::EventTime, watermark);
        self.process_timers(fired, FiringKind::Watermark, out)
    }

    fn on_processing_time(
        &mut self,
        now: i64,
        out: &mut Vec<Pane<K, A::Output>>,
    ) -> Result<(), EngineError> {
        if now < self.processing_time {
            trace!(
                current = self.processing_time,
                rejected = now,
                "ignored processing time regression"
            );
            return Ok(());
        }
        self.processing_time = now;
        let fired = self.timers.poll(TimeDomain::ProcessingTime, now);
        self.process_timers(fired, FiringKind::ProcessingTime, out)
    }

    /// Runs one fire-check per (key, window) among `fired`, in timer order,
    /// then collects windows the watermark has expired.
    fn process_timers(
        &mut self,
        fired: FiredTimers<K>,
        cause: FiringKind,
        out: &mut Vec<Pane<K, A::Output>>,
    ) -> Result<(), EngineError> {
        let mut due: Vec<(K, Window, u64)> = Vec::new();
        let mut index: FxHashMap<(K, Window), usize> = FxHashMap::default();
        for timer in fired {
            self.undo
                .timers_removed(&timer.key, timer.window, smallvec![(timer.domain, timer.timestamp)]);
            match index.get(&(timer.key.clone(), timer.window)) {
                Some(&slot) => due[slot].2 += 1,
                None => {
                    index.insert((timer.key.clone(), timer.window), due.len());
                    due.push((timer.key, timer.window, 1));
                }
            }
        }

        let watermark = self.tracker.input_watermark().timestamp();
        let lateness = self.strategy.allowed_lateness_ms;
        for (key, window, count) in due {
            if self.store.get(&key, &window).is_none() {
                self.metrics.stale_timers += count;
                trace!(?key, %window, timers = count, "dropped stale timers");
                continue;
            }
            self.check_trigger(&key, window, cause, out)?;
            if cause == FiringKind::Watermark && window.is_expired(lateness, watermark) {
                self.expire(&key, window, out)?;
            }
        }
        Ok(())
    }

    fn check_trigger(
        &mut self,
        key: &K,
        window: Window,
        cause: FiringKind,
        out: &mut Vec<Pane<K, A::Output>>,
    ) -> Result<(), EngineError> {
        let ctx = self.context(window);
        self.undo.record_state(&self.store, key, &window);
        let Some(state) = self.store.get_mut(key, &window) else {
            return Ok(());
        };
        if state.is_terminal() {
            return Ok(());
        }
        let result = self.evaluator.evaluate(&mut state.trigger, &ctx);
        self.register_trigger_timers(key, window);
        if result.is_fire() {
            self.fire(key, window, result, cause, out)?;
        }
        Ok(())
    }

    /// Emits a pane for a firing that the trigger already applied.
    fn fire(
        &mut self,
        key: &K,
        window: Window,
        result: TriggerResult,
        cause: FiringKind,
        out: &mut Vec<Pane<K, A::Output>>,
    ) -> Result<(), EngineError> {
        let watermark = self.tracker.input_watermark().timestamp();
        let is_last = result.is_finish();
        let mode = self.strategy.accumulation_mode;
        let closing = self.strategy.closing_behavior;
        let on_time = self.strategy.on_time_behavior;

        self.undo.record_state(&self.store, key, &window);
        let Some(state) = self.store.get_mut(key, &window) else {
            return Ok(());
        };
        let timing = state.pane.classify(&window, watermark, cause);
        let emit = state.pane.has_pending()
            || if is_last {
                closing == ClosingBehavior::FireAlways
            } else {
                timing == PaneTiming::OnTime && on_time == OnTimeBehavior::FireAlways
            };

        let pane = if emit {
            let (value, info) = state.pane.fire(&self.aggregator, timing, is_last, mode)?;
            Some(Pane {
                key: key.clone(),
                window,
                value,
                info,
                mode,
                watermark: self.tracker.output_watermark(),
            })
        } else {
            None
        };
        let released = if is_last {
            state.status = WindowStatus::Terminal;
            state.hold.take()
        } else {
            None
        };

        if let Some(hold) = released {
            self.release_hold(hold);
        }
        if let Some(pane) = pane {
            self.metrics.record_pane(pane.info.timing);
            debug!(
                ?key,
                %window,
                index = pane.info.index,
                timing = ?pane.info.timing,
                is_last,
                "emitted pane"
            );
            out.push(pane);
        }
        Ok(())
    }

    /// Closes a window whose garbage-collection time has passed.
    fn expire(
        &mut self,
        key: &K,
        window: Window,
        out: &mut Vec<Pane<K, A::Output>>,
    ) -> Result<(), EngineError> {
        let terminal = match self.store.get(key, &window) {
            Some(state) => state.is_terminal(),
            None => return Ok(()),
        };
        if !terminal {
            self.fire(key, window, TriggerResult::FireAndFinish, FiringKind::Watermark, out)?;
        }

        if let Some(state) = self.remove_state(key, &window) {
            if let Some(hold) = state.hold {
                self.release_hold(hold);
            }
        }
        self.cancel_timers(key, &window);
        self.forget_redirects(key, window);
        self.metrics.windows_expired += 1;
        debug!(?key, %window, "garbage collected window");
        Ok(())
    }

    fn create_window(&mut self, key: &K, window: Window) -> Result<(), EngineError> {
        let state = KeyedWindowState::new(
            PaneAccumulator::new(self.aggregator.create_accumulator()),
            self.evaluator.new_state(),
        );
        self.put_state(key, window, state)?;
        self.register_window_timers(key, window);
        self.metrics.windows_created += 1;
        Ok(())
    }

    /// Merges the key's windows to a fixed point.
    fn merge_key_windows(&mut self, key: &K) -> Result<(), EngineError> {
        let Some(slack) = self.strategy.assigner.merge_slack() else {
            return Ok(());
        };
        let windows = self.store.windows(key);
        if windows.len() < 2 {
            return Ok(());
        }
        for group in merge_windows(&windows, slack) {
            self.merge_group(key, &group.sources, group.result)?;
        }
        Ok(())
    }

    fn merge_group(&mut self, key: &K, sources: &[Window], result: Window) -> Result<(), EngineError> {
        let mut pane = PaneAccumulator::new(self.aggregator.create_accumulator());
        let mut triggers: Vec<TriggerState> = Vec::with_capacity(sources.len());
        let mut hold: Option<i64> = None;
        let mut terminal = false;
        // Unfired elements of open sources, lost if the result is closed
        let mut open_pending = 0u64;

        for window in sources {
            let Some(state) = self.remove_state(key, window) else {
                continue;
            };
            self.cancel_timers(key, window);
            if let Some(h) = state.hold {
                self.release_hold(h);
                hold = Some(hold.map_or(h, |current| current.min(h)));
            }
            if state.is_terminal() {
                terminal = true;
            } else {
                open_pending += state.pane.pending_elements();
            }
            pane.merge_from(&self.aggregator, state.pane)?;
            triggers.push(state.trigger);
        }

        let ctx = self.context(result);
        let sources_state: Vec<&TriggerState> = triggers.iter().collect();
        let mut merged = KeyedWindowState::new(pane, self.evaluator.merge_states(&sources_state, &ctx));
        if terminal || merged.trigger.is_finished() {
            merged.status = WindowStatus::Terminal;
            if open_pending > 0 {
                self.metrics.dropped_closed += open_pending;
                debug!(
                    ?key,
                    window = %result,
                    ?sources,
                    dropped = open_pending,
                    "merged into closed window, dropped pending elements"
                );
            }
        } else if let Some(h) = hold {
            merged.hold = Some(h);
            self.set_hold(h);
        }
        self.put_state(key, result, merged)?;
        self.register_window_timers(key, result);
        self.record_redirects(key, sources, result);

        let merged_away = sources.iter().filter(|w| **w != result).count();
        self.metrics.windows_merged += merged_away as u64;
        debug!(?key, window = %result, merged = sources.len(), "merged windows");
        Ok(())
    }

    /// Follows the merge log of `key` to the live window `window` became.
    fn resolve(&self, key: &K, window: Window) -> Window {
        self.merge_logs
            .get(key)
            .and_then(|log| log.get(&window))
            .copied()
            .unwrap_or(window)
    }

    /// Points every merged-away source, and everything redirected to one,
    /// at `result`.
    fn record_redirects(&mut self, key: &K, sources: &[Window], result: Window) {
        self.undo.record_merge_log(&self.merge_logs, key);
        let log = self.merge_logs.entry(key.clone()).or_default();
        for target in log.values_mut() {
            if sources.contains(target) {
                *target = result;
            }
        }
        for window in sources {
            if *window != result {
                log.insert(*window, result);
            }
        }
        log.remove(&result);
        if log.is_empty() {
            self.merge_logs.remove(key);
        }
    }

    /// Drops redirects into a destroyed window.
    fn forget_redirects(&mut self, key: &K, window: Window) {
        let points_here = self
            .merge_logs
            .get(key)
            .is_some_and(|log| log.values().any(|target| *target == window));
        if !points_here {
            return;
        }
        self.undo.record_merge_log(&self.merge_logs, key);
        if let Some(log) = self.merge_logs.get_mut(key) {
            log.retain(|_, target| *target != window);
            if log.is_empty() {
                self.merge_logs.remove(key);
            }
        }
    }

    fn context(&self, window: Window) -> TriggerContext {
        TriggerContext {
            window,
            watermark: self.tracker.input_watermark().timestamp(),
            processing_time: self.processing_time,
        }
    }

    fn register_window_timers(&mut self, key: &K, window: Window) {
        let lateness = self.strategy.allowed_lateness_ms;
        self.register_timer(key, window, TimeDomain::EventTime, window.end());
        self.register_timer(key, window, TimeDomain::EventTime, window.gc_time(lateness));
        self.register_trigger_timers(key, window);
    }

    fn register_trigger_timers(&mut self, key: &K, window: Window) {
        let Some(state) = self.store.get(key, &window) else {
            return;
        };
        for (domain, timestamp) in self.evaluator.timers(&state.trigger, &window) {
            self.register_timer(key, window, domain, timestamp);
        }
    }

    fn register_timer(&mut self, key: &K, window: Window, domain: TimeDomain, timestamp: i64) {
        if self.timers.register(key.clone(), window, domain, timestamp) {
            self.undo.timer_added(key, window, domain, timestamp);
        }
    }

    fn cancel_timers(&mut self, key: &K, window: &Window) {
        let removed = self.timers.cancel_window(key, window);
        self.undo.timers_removed(key, *window, removed);
    }

    fn put_state(
        &mut self,
        key: &K,
        window: Window,
        state: KeyedWindowState<A::Acc>,
    ) -> Result<(), StateError> {
        self.undo.record_state(&self.store, key, &window);
        self.store.put(key.clone(), window, state)
    }

    fn remove_state(&mut self, key: &K, window: &Window) -> Option<KeyedWindowState<A::Acc>> {
        self.undo.record_state(&self.store, key, window);
        self.store.remove(key, window)
    }

    fn set_hold(&mut self, timestamp: i64) {
        self.tracker.set_hold(timestamp);
        self.undo.hold_added(timestamp);
    }

    fn release_hold(&mut self, timestamp: i64) {
        if self.tracker.release_hold(timestamp) {
            self.undo.hold_released(timestamp);
        }
    }
}
