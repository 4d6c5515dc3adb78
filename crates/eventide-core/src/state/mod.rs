//! # Window State Module
//!
//! Per (key, window) state for the grouping engine and the store it lives in.
//!
//! ## Lifecycle
//!
//! A [`KeyedWindowState`] is created by the first element for a new
//! (key, window), mutated by every later element, timer or watermark, and
//! destroyed once the watermark passes the window's garbage-collection time.
//! In between it moves from [`WindowStatus::Open`] to
//! [`WindowStatus::Terminal`] when its trigger finishes.
//!
//! ## Backends
//!
//! - **[`InMemoryWindowStore`]**: hash map of keys to ordered window maps,
//!   with an optional limit on the number of live windows
//!
//! The [`WindowStore`] trait is the seam a runner uses to provide its own
//! (for example durable) storage.
//!
//! ## Example
//!
//! ```rust
//! use eventide_core::pane::PaneAccumulator;
//! use eventide_core::state::{InMemoryWindowStore, KeyedWindowState, WindowStore};
//! use eventide_core::trigger::{Trigger, TriggerEvaluator};
//! use eventide_core::window::Window;
//!
//! let evaluator = TriggerEvaluator::new(&Trigger::default()).unwrap();
//! let mut store = InMemoryWindowStore::<&str, i64>::new();
//!
//! let window = Window::interval(0, 60);
//! let state = KeyedWindowState::new(PaneAccumulator::new(0), evaluator.new_state());
//! store.put("k", window, state).unwrap();
//!
//! assert!(store.get(&"k", &window).is_some());
//! assert_eq!(store.windows(&"k").as_slice(), &[window]);
//! assert_eq!(store.window_count(), 1);
//! ```

use std::collections::BTreeMap;
use std::hash::Hash;

use fxhash::FxHashMap;

use crate::pane::PaneAccumulator;
use crate::trigger::TriggerState;
use crate::window::{Window, WindowVec};

/// Lifecycle status of a (key, window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowStatus {
    /// Accepting elements and firings.
    #[default]
    Open,
    /// The trigger finished; input is dropped until the state is collected.
    Terminal,
}

/// State held for one (key, window).
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedWindowState<Acc> {
    /// Buffered aggregate and pane sequence
    pub pane: PaneAccumulator<Acc>,
    /// Trigger state for this window
    pub trigger: TriggerState,
    /// Watermark hold, while the window has data awaiting its final pane
    pub hold: Option<i64>,
    /// Lifecycle status
    pub status: WindowStatus,
}

impl<Acc> KeyedWindowState<Acc> {
    /// Creates open state with no hold.
    #[must_use]
    pub fn new(pane: PaneAccumulator<Acc>, trigger: TriggerState) -> Self {
        Self {
            pane,
            trigger,
            hold: None,
            status: WindowStatus::Open,
        }
    }

    /// Returns true if the window no longer accepts input.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status == WindowStatus::Terminal
    }
}

/// Storage for [`KeyedWindowState`] keyed by (key, window).
///
/// # Thread Safety
///
/// Stores are `Send` but not `Sync`. Each store is owned by exactly one
/// engine; concurrent access goes through the stage's partition locks.
pub trait WindowStore<K, Acc>: Send {
    /// Returns the state of a (key, window).
    fn get(&self, key: &K, window: &Window) -> Option<&KeyedWindowState<Acc>>;

    /// Returns the state of a (key, window) for mutation.
    fn get_mut(&mut self, key: &K, window: &Window) -> Option<&mut KeyedWindowState<Acc>>;

    /// Stores the state of a (key, window), replacing any previous state.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the state cannot be stored (for example when a
    /// capacity limit is reached).
    fn put(&mut self, key: K, window: Window, state: KeyedWindowState<Acc>)
        -> Result<(), StateError>;

    /// Removes and returns the state of a (key, window).
    fn remove(&mut self, key: &K, window: &Window) -> Option<KeyedWindowState<Acc>>;

    /// Returns the windows that currently hold state for `key`, sorted.
    fn windows(&self, key: &K) -> WindowVec;

    /// Returns the number of live (key, window) states.
    fn window_count(&self) -> usize;

    /// Returns the number of keys with at least one live window.
    fn key_count(&self) -> usize;

    /// Returns the number of elements buffered across all windows.
    fn buffered_elements(&self) -> u64;
}

/// In-memory window store.
///
/// # Performance Characteristics
///
/// - **Get/Put/Remove**: O(1) key lookup + O(log w) in the key's windows
/// - **Windows of a key**: O(w)
/// - **Buffered elements**: O(total windows)
#[derive(Debug, Clone)]
pub struct InMemoryWindowStore<K, Acc> {
    data: FxHashMap<K, BTreeMap<Window, KeyedWindowState<Acc>>>,
    window_count: usize,
    max_windows: Option<usize>,
}

impl<K, Acc> InMemoryWindowStore<K, Acc>
where
    K: Eq + Hash,
{
    /// Creates a new empty store without a window limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: FxHashMap::default(),
            window_count: 0,
            max_windows: None,
        }
    }

    /// Creates a store that rejects new windows beyond `max_windows`.
    #[must_use]
    pub fn with_max_windows(max_windows: usize) -> Self {
        Self {
            max_windows: Some(max_windows),
            ..Self::new()
        }
    }

    /// Removes all state.
    pub fn clear(&mut self) {
        self.data.clear();
        self.window_count = 0;
    }
}

impl<K, Acc> Default for InMemoryWindowStore<K, Acc>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, Acc> WindowStore<K, Acc> for InMemoryWindowStore<K, Acc>
where
    K: Eq + Hash + Send,
    Acc: Clone + Send,
{
    #[inline]
    fn get(&self, key: &K, window: &Window) -> Option<&KeyedWindowState<Acc>> {
        self.data.get(key)?.get(window)
    }

    #[inline]
    fn get_mut(&mut self, key: &K, window: &Window) -> Option<&mut KeyedWindowState<Acc>> {
        self.data.get_mut(key)?.get_mut(window)
    }

    fn put(
        &mut self,
        key: K,
        window: Window,
        state: KeyedWindowState<Acc>,
    ) -> Result<(), StateError> {
        let exists = self
            .data
            .get(&key)
            .is_some_and(|windows| windows.contains_key(&window));
        if !exists {
            if let Some(max) = self.max_windows {
                if self.window_count >= max {
                    return Err(StateError::CapacityExceeded(format!(
                        "window limit of {max} reached"
                    )));
                }
            }
            self.window_count += 1;
        }
        self.data.entry(key).or_default().insert(window, state);
        Ok(())
    }

    fn remove(&mut self, key: &K, window: &Window) -> Option<KeyedWindowState<Acc>> {
        let windows = self.data.get_mut(key)?;
        let state = windows.remove(window)?;
        if windows.is_empty() {
            self.data.remove(key);
        }
        self.window_count -= 1;
        Some(state)
    }

    fn windows(&self, key: &K) -> WindowVec {
        self.data
            .get(key)
            .map(|windows| windows.keys().copied().collect())
            .unwrap_or_default()
    }

    fn window_count(&self) -> usize {
        self.window_count
    }

    fn key_count(&self) -> usize {
        self.data.len()
    }

    fn buffered_elements(&self) -> u64 {
        self.data
            .values()
            .flat_map(BTreeMap::values)
            .map(|state| state.pane.buffered_elements())
            .sum()
    }
}

/// Errors that can occur in state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Store capacity exceeded
    #[error("Store capacity exceeded: {0}")]
    CapacityExceeded(String),
}
