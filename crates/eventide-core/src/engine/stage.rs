//! # Stage Runner
//!
//! A [`Stage`] runs one grouping operation over several key partitions.
//!
//! Each partition owns a [`GroupByKeyEngine`] behind its own lock, so a
//! key's state is only ever touched by one thread. Bundles are split by
//! `hash(key) % partitions`; watermark and clock inputs are broadcast to
//! every partition at their position in the bundle. Partitions run in
//! parallel on scoped threads and the bundle commits on all of them or on
//! none. Panes of a committed bundle are handed to the downstream consumer
//! through an unbounded channel.
//!
//! ## Example
//!
//! ```rust
//! use eventide_core::engine::{Input, Record, Stage, StageConfig, WindowingStrategy};
//! use eventide_core::pane::CountAggregator;
//! use eventide_core::window::WindowAssigner;
//!
//! let strategy = WindowingStrategy::new(WindowAssigner::fixed(60).unwrap());
//! let (stage, mut panes) =
//!     Stage::open(StageConfig::new("counts", 2), strategy, CountAggregator::<()>::new()).unwrap();
//!
//! stage
//!     .process_bundle(vec![
//!         Input::Element(Record::new("a", (), 10)),
//!         Input::Element(Record::new("b", (), 20)),
//!     ])
//!     .unwrap();
//! assert_eq!(stage.advance_watermark(0, 60).unwrap(), 2);
//!
//! let first = panes.try_recv().unwrap();
//! assert_eq!(first.value, 1);
//! ```

use std::fmt::{self, Debug};
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ConfigError, EngineError, EngineMetrics, GroupByKeyEngine, Input, StageConfig, WindowingStrategy};
use crate::pane::{Aggregator, Pane};
use crate::time::Watermark;

/// Errors raised by a [`Stage`].
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Invalid stage or strategy configuration
    #[error("Invalid stage configuration: {0}")]
    Config(#[from] ConfigError),

    /// A partition failed; every partition was rolled back
    #[error("Partition {partition} failed: {source}")]
    Partition {
        /// Failing partition
        partition: usize,
        /// Underlying engine error
        source: EngineError,
    },

    /// A partition worker panicked; every partition was rolled back
    #[error("Partition {0} worker panicked")]
    WorkerPanicked(usize),

    /// The downstream pane receiver was dropped
    #[error("Pane receiver dropped")]
    ChannelClosed,
}

type PaneSender<K, A> = mpsc::UnboundedSender<Pane<K, <A as Aggregator>::Output>>;

/// Partitioned, parallel runner of a grouping operation.
pub struct Stage<K, A>
where
    A: Aggregator,
{
    config: StageConfig,
    partitions: Vec<Mutex<GroupByKeyEngine<K, A>>>,
    sender: PaneSender<K, A>,
}

impl<K, A: Aggregator> fmt::Debug for Stage<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("config", &self.config)
            .field("partitions", &self.partitions.len())
            .finish_non_exhaustive()
    }
}

impl<K, A> Stage<K, A>
where
    K: Clone + Eq + Hash + Debug + Send,
    A: Aggregator + Clone,
    A::Input: Clone + Send,
    A::Output: Send,
{
    /// Initialises per-stage state: one engine per partition.
    ///
    /// Returns the stage and the receiving end of its pane channel.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Config`] if the stage or the strategy is invalid.
    #[allow(clippy::type_complexity)]
    pub fn open(
        config: StageConfig,
        strategy: WindowingStrategy,
        aggregator: A,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Pane<K, A::Output>>), StageError> {
        config.validate()?;
        let partitions = (0..config.partitions)
            .map(|_| GroupByKeyEngine::new(strategy.clone(), aggregator.clone()).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        debug!(stage = %config.name, partitions = config.partitions, "opened stage");
        Ok((
            Self {
                config,
                partitions,
                sender,
            },
            receiver,
        ))
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the number of partitions.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Returns the partition that owns `key`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn partition_of(&self, key: &K) -> usize {
        (fxhash::hash64(key) as usize) % self.partitions.len()
    }

    /// Processes a bundle across all partitions as one unit of work.
    ///
    /// Returns the number of panes sent downstream.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] if any partition fails; no partition keeps any
    /// change and no pane is sent.
    pub fn process_bundle(&self, inputs: Vec<Input<K, A::Input>>) -> Result<usize, StageError> {
        let mut bundles: Vec<Vec<Input<K, A::Input>>> =
            (0..self.partitions.len()).map(|_| Vec::new()).collect();
        for input in inputs {
            match input {
                Input::Element(record) => {
                    let partition = self.partition_of(&record.key);
                    bundles[partition].push(Input::Element(record));
                }
                broadcast => {
                    for bundle in &mut bundles {
                        bundle.push(broadcast.clone());
                    }
                }
            }
        }
        self.run(bundles, false)
    }

    /// Advances the watermark of an upstream source on every partition.
    ///
    /// # Errors
    ///
    /// See [`process_bundle`](Self::process_bundle).
    pub fn advance_watermark(&self, source: usize, watermark: i64) -> Result<usize, StageError> {
        self.process_bundle(vec![Input::Watermark { source, watermark }])
    }

    /// Marks an upstream source idle on every partition.
    ///
    /// # Errors
    ///
    /// See [`process_bundle`](Self::process_bundle).
    pub fn mark_source_idle(&self, source: usize) -> Result<usize, StageError> {
        self.process_bundle(vec![Input::SourceIdle(source)])
    }

    /// Advances the processing clock on every partition.
    ///
    /// # Errors
    ///
    /// See [`process_bundle`](Self::process_bundle).
    pub fn advance_processing_time(&self, now: i64) -> Result<usize, StageError> {
        self.process_bundle(vec![Input::ProcessingTime(now)])
    }

    /// Returns the stage output watermark: the minimum over partitions.
    #[must_use]
    pub fn output_watermark(&self) -> Watermark {
        self.partitions
            .iter()
            .map(|engine| engine.lock().output_watermark())
            .fold(Watermark::MAX, Watermark::min)
    }

    /// Returns the number of elements buffered across all partitions.
    #[must_use]
    pub fn buffered_elements(&self) -> u64 {
        self.partitions
            .iter()
            .map(|engine| engine.lock().buffered_elements())
            .sum()
    }

    /// Returns the number of live windows across all partitions.
    #[must_use]
    pub fn active_windows(&self) -> usize {
        self.partitions
            .iter()
            .map(|engine| engine.lock().active_windows())
            .sum()
    }

    /// Returns the counters of all partitions combined.
    #[must_use]
    pub fn metrics(&self) -> EngineMetrics {
        let mut metrics = EngineMetrics::new();
        for engine in &self.partitions {
            metrics.merge(&engine.lock().metrics());
        }
        metrics
    }

    /// Tears the stage down: every partition advances to
    /// [`Watermark::MAX`], flushing all windows, and the state is dropped.
    ///
    /// The flush is one unit of work across partitions. The pane channel
    /// closes once the stage is gone.
    ///
    /// # Errors
    ///
    /// If a partition fails to flush, every partition is rolled back, no
    /// pane is sent, and the stage is handed back with the error so the
    /// caller can retry.
    #[allow(clippy::result_large_err)]
    pub fn close(self) -> Result<usize, (Self, StageError)> {
        let bundles = (0..self.partitions.len()).map(|_| Vec::new()).collect();
        let result = self.run(bundles, true);
        match result {
            Ok(sent) => {
                debug!(stage = %self.config.name, panes = sent, "closed stage");
                Ok(sent)
            }
            Err(err) => Err((self, err)),
        }
    }

    /// Applies one bundle per partition, then flushes every partition if
    /// `flush` is set, committing on all partitions or none.
    fn run(&self, bundles: Vec<Vec<Input<K, A::Input>>>, flush: bool) -> Result<usize, StageError> {
        let mut guards: Vec<_> = self.partitions.iter().map(|engine| engine.lock()).collect();

        let results: Vec<Result<Vec<Pane<K, A::Output>>, StageError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = guards
                .iter_mut()
                .zip(bundles)
                .enumerate()
                .map(|(partition, (guard, bundle))| {
                    let engine: &mut GroupByKeyEngine<K, A> = guard;
                    scope.spawn(move || {
                        engine.begin();
                        let mut out = Vec::new();
                        bundle
                            .into_iter()
                            .try_for_each(|input| engine.apply(input, &mut out))
                            .and_then(|()| if flush { engine.flush(&mut out) } else { Ok(()) })
                            .map(|()| out)
                            .map_err(|source| StageError::Partition { partition, source })
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(partition, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(StageError::WorkerPanicked(partition)))
                })
                .collect()
        });

        let mut panes = Vec::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(partition_panes) => panes.extend(partition_panes),
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = failure {
            for engine in &mut guards {
                engine.rollback();
            }
            warn!(stage = %self.config.name, error = %err, flush, "bundle failed, all partitions rolled back");
            return Err(err);
        }
        for engine in &mut guards {
            engine.commit();
        }
        drop(guards);

        let sent = panes.len();
        for pane in panes {
            self.sender
                .send(pane)
                .map_err(|_| StageError::ChannelClosed)?;
        }
        Ok(sent)
    }
}
