//! Undo log for a unit of work.
//!
//! Every mutation the engine makes while processing an element, a bundle or
//! a time advance is journaled here first. Committing drops the journal;
//! rolling back replays it backwards, leaving the engine exactly as it was
//! when the unit of work began.

use std::hash::Hash;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::metrics::EngineMetrics;
use crate::state::{KeyedWindowState, WindowStore};
use crate::time::{TimeDomain, TrackerSnapshot};
use crate::window::Window;

/// Redirections of merged-away windows for one key.
pub(crate) type MergeLog = FxHashMap<Window, Window>;

/// One reversible mutation.
#[derive(Debug)]
pub(crate) enum UndoEntry<K, Acc> {
    /// State of a (key, window) before its first change in this unit of work
    State {
        key: K,
        window: Window,
        before: Option<KeyedWindowState<Acc>>,
    },
    /// Merge log of a key before its first change in this unit of work
    MergeLog { key: K, before: Option<MergeLog> },
    /// A hold was registered
    HoldAdded(i64),
    /// A hold was released
    HoldReleased(i64),
    /// A timer was registered
    TimerAdded {
        key: K,
        window: Window,
        domain: TimeDomain,
        timestamp: i64,
    },
    /// Timers were cancelled or fired
    TimersRemoved {
        key: K,
        window: Window,
        timers: SmallVec<[(TimeDomain, i64); 4]>,
    },
}

/// Scalar engine state captured when a unit of work begins.
#[derive(Debug)]
pub(crate) struct Checkpoint {
    pub(crate) tracker: TrackerSnapshot,
    pub(crate) metrics: EngineMetrics,
    pub(crate) processing_time: i64,
}

/// Journal of the unit of work in progress.
#[derive(Debug)]
pub(crate) struct UndoLog<K, Acc> {
    entries: Vec<UndoEntry<K, Acc>>,
    touched: FxHashSet<(K, Window)>,
    touched_logs: FxHashSet<K>,
    checkpoint: Option<Checkpoint>,
}

impl<K, Acc> Default for UndoLog<K, Acc> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            touched: FxHashSet::default(),
            touched_logs: FxHashSet::default(),
            checkpoint: None,
        }
    }
}

impl<K, Acc> UndoLog<K, Acc>
where
    K: Clone + Eq + Hash,
    Acc: Clone,
{
    /// Starts a new unit of work, discarding any previous journal.
    pub(crate) fn begin(&mut self, checkpoint: Checkpoint) {
        self.entries.clear();
        self.touched.clear();
        self.touched_logs.clear();
        self.checkpoint = Some(checkpoint);
    }

    /// Returns true while a unit of work is open.
    pub(crate) fn is_active(&self) -> bool {
        self.checkpoint.is_some()
    }

    /// Ends the unit of work, keeping every change.
    pub(crate) fn commit(&mut self) {
        self.entries.clear();
        self.touched.clear();
        self.touched_logs.clear();
        self.checkpoint = None;
    }

    /// Ends the unit of work, returning what is needed to undo it.
    ///
    /// Entries are returned newest first.
    pub(crate) fn take(&mut self) -> (Vec<UndoEntry<K, Acc>>, Option<Checkpoint>) {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        self.touched.clear();
        self.touched_logs.clear();
        (entries, self.checkpoint.take())
    }

    /// Captures the pre-image of a (key, window) on its first change.
    pub(crate) fn record_state<S>(&mut self, store: &S, key: &K, window: &Window)
    where
        S: WindowStore<K, Acc> + ?Sized,
    {
        if !self.is_active() || !self.touched.insert((key.clone(), *window)) {
            return;
        }
        self.entries.push(UndoEntry::State {
            key: key.clone(),
            window: *window,
            before: store.get(key, window).cloned(),
        });
    }

    /// Captures the pre-image of a key's merge log on its first change.
    pub(crate) fn record_merge_log(&mut self, logs: &FxHashMap<K, MergeLog>, key: &K) {
        if !self.is_active() || !self.touched_logs.insert(key.clone()) {
            return;
        }
        self.entries.push(UndoEntry::MergeLog {
            key: key.clone(),
            before: logs.get(key).cloned(),
        });
    }

    pub(crate) fn hold_added(&mut self, timestamp: i64) {
        self.push(UndoEntry::HoldAdded(timestamp));
    }

    pub(crate) fn hold_released(&mut self, timestamp: i64) {
        self.push(UndoEntry::HoldReleased(timestamp));
    }

    pub(crate) fn timer_added(&mut self, key: &K, window: Window, domain: TimeDomain, timestamp: i64) {
        self.push(UndoEntry::TimerAdded {
            key: key.clone(),
            window,
            domain,
            timestamp,
        });
    }

    pub(crate) fn timers_removed(
        &mut self,
        key: &K,
        window: Window,
        timers: SmallVec<[(TimeDomain, i64); 4]>,
    ) {
        if timers.is_empty() {
            return;
        }
        self.push(UndoEntry::TimersRemoved {
            key: key.clone(),
            window,
            timers,
        });
    }

    fn push(&mut self, entry: UndoEntry<K, Acc>) {
        if self.is_active() {
            self.entries.push(entry);
        }
    }
}
