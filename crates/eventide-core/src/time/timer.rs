//! Timer service for per-window fire-checks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::hash::Hash;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::TimeDomain;
use crate::window::Window;

/// Heaps smaller than this are never compacted.
const COMPACT_MIN_QUEUED: usize = 1024;

/// Heaps are compacted once queued entries outnumber live timers this much.
const COMPACT_RATIO: usize = 4;

/// Collection type for fired timers.
///
/// Uses `SmallVec` to avoid heap allocation when few timers fire per poll.
pub type FiredTimers<K> = SmallVec<[TimerRegistration<K>; 8]>;

/// A timer registration for one (key, window).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRegistration<K> {
    /// Registration sequence number, used to keep firing order stable
    pub id: u64,
    /// Grouping key the timer belongs to
    pub key: K,
    /// Window the timer belongs to
    pub window: Window,
    /// Clock the timer is scheduled against
    pub domain: TimeDomain,
    /// Scheduled timestamp in milliseconds
    pub timestamp: i64,
}

impl<K: Eq> Ord for TimerRegistration<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (earliest first, then FIFO)
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl<K: Eq> PartialOrd for TimerRegistration<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Timer service keyed by (key, window, domain, timestamp).
///
/// Registering the same timer twice is a no-op. Cancelled timers are removed
/// from the live index immediately and skipped lazily when they reach the
/// top of the heap; the heaps are rebuilt once cancelled entries dominate.
///
/// # Example
///
/// ```rust
/// use eventide_core::time::{TimeDomain, TimerService};
/// use eventide_core::window::Window;
///
/// let mut service = TimerService::new();
/// let window = Window::interval(0, 60);
///
/// service.register("k", window, TimeDomain::EventTime, 60);
/// service.register("k", window, TimeDomain::EventTime, 30);
///
/// let fired = service.poll(TimeDomain::EventTime, 45);
/// assert_eq!(fired.len(), 1);
/// assert_eq!(fired[0].timestamp, 30);
/// ```
#[derive(Debug, Clone)]
pub struct TimerService<K> {
    event_time: BinaryHeap<TimerRegistration<K>>,
    processing_time: BinaryHeap<TimerRegistration<K>>,
    live: FxHashMap<(K, Window), SmallVec<[(TimeDomain, i64); 4]>>,
    live_count: usize,
    next_timer_id: u64,
}

impl<K> TimerService<K>
where
    K: Clone + Eq + Hash,
{
    /// Creates a new timer service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            event_time: BinaryHeap::new(),
            processing_time: BinaryHeap::new(),
            live: FxHashMap::default(),
            live_count: 0,
            next_timer_id: 0,
        }
    }

    /// Registers a timer.
    ///
    /// Returns `true` if the timer was not already pending.
    pub fn register(&mut self, key: K, window: Window, domain: TimeDomain, timestamp: i64) -> bool {
        let slots = self.live.entry((key.clone(), window)).or_default();
        if slots.contains(&(domain, timestamp)) {
            return false;
        }
        slots.push((domain, timestamp));
        self.live_count += 1;

        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let registration = TimerRegistration {
            id,
            key,
            window,
            domain,
            timestamp,
        };
        match domain {
            TimeDomain::EventTime => self.event_time.push(registration),
            TimeDomain::ProcessingTime => self.processing_time.push(registration),
        }
        true
    }

    /// Cancels a single pending timer.
    ///
    /// Returns `true` if the timer was pending.
    pub fn cancel(&mut self, key: &K, window: &Window, domain: TimeDomain, timestamp: i64) -> bool {
        let cancelled = self.remove_live(key, window, domain, timestamp);
        if cancelled {
            self.maybe_compact();
        }
        cancelled
    }

    fn remove_live(&mut self, key: &K, window: &Window, domain: TimeDomain, timestamp: i64) -> bool {
        let lookup = (key.clone(), *window);
        let Some(slots) = self.live.get_mut(&lookup) else {
            return false;
        };
        let Some(pos) = slots.iter().position(|&slot| slot == (domain, timestamp)) else {
            return false;
        };
        slots.swap_remove(pos);
        if slots.is_empty() {
            self.live.remove(&lookup);
        }
        self.live_count -= 1;
        true
    }

    /// Cancels every pending timer of a window.
    ///
    /// Returns the cancelled `(domain, timestamp)` pairs.
    pub fn cancel_window(&mut self, key: &K, window: &Window) -> SmallVec<[(TimeDomain, i64); 4]> {
        let removed = self
            .live
            .remove(&(key.clone(), *window))
            .unwrap_or_default();
        self.live_count -= removed.len();
        if !removed.is_empty() {
            self.maybe_compact();
        }
        removed
    }

    fn maybe_compact(&mut self) {
        let queued = self.event_time.len() + self.processing_time.len();
        if queued > COMPACT_MIN_QUEUED && queued > self.live_count.saturating_mul(COMPACT_RATIO) {
            self.compact();
        }
    }

    /// Rebuilds both heaps from their live entries.
    ///
    /// Of several entries for the same timer only the earliest registration
    /// is kept, which is the one `poll` would have fired.
    fn compact(&mut self) {
        let live = &self.live;
        for heap in [&mut self.event_time, &mut self.processing_time] {
            let mut entries = std::mem::take(heap).into_vec();
            entries.sort_unstable_by_key(|timer| (timer.timestamp, timer.id));
            let mut seen = FxHashSet::default();
            entries.retain(|timer| {
                let pending = live
                    .get(&(timer.key.clone(), timer.window))
                    .is_some_and(|slots| slots.contains(&(timer.domain, timer.timestamp)));
                pending && seen.insert((timer.key.clone(), timer.window, timer.timestamp))
            });
            *heap = BinaryHeap::from(entries);
        }
    }

    /// Polls for timers in `domain` scheduled at or before `up_to`.
    ///
    /// Timers are returned in non-decreasing timestamp order and are no
    /// longer pending afterwards.
    pub fn poll(&mut self, domain: TimeDomain, up_to: i64) -> FiredTimers<K> {
        let mut fired = FiredTimers::new();
        loop {
            let heap = match domain {
                TimeDomain::EventTime => &mut self.event_time,
                TimeDomain::ProcessingTime => &mut self.processing_time,
            };
            match heap.peek() {
                Some(timer) if timer.timestamp <= up_to => {}
                _ => break,
            }
            let Some(timer) = heap.pop() else {
                break;
            };
            if self.remove_live(&timer.key, &timer.window, timer.domain, timer.timestamp) {
                fired.push(timer);
            }
        }
        fired
    }

    /// Returns true if the given timer is pending.
    #[must_use]
    pub fn is_pending(&self, key: &K, window: &Window, domain: TimeDomain, timestamp: i64) -> bool {
        self.live
            .get(&(key.clone(), *window))
            .is_some_and(|slots| slots.contains(&(domain, timestamp)))
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.live_count
    }

    /// Returns the timestamp of the next pending timer in `domain`, if any.
    ///
    /// May report a cancelled timer that has not been skipped yet; polling
    /// at that time simply returns nothing.
    #[must_use]
    pub fn next_timer_timestamp(&self, domain: TimeDomain) -> Option<i64> {
        match domain {
            TimeDomain::EventTime => self.event_time.peek(),
            TimeDomain::ProcessingTime => self.processing_time.peek(),
        }
        .map(|t| t.timestamp)
    }

    /// Clears all pending timers.
    pub fn clear(&mut self) {
        self.event_time.clear();
        self.processing_time.clear();
        self.live.clear();
        self.live_count = 0;
    }
}

impl<K> Default for TimerService<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: i64) -> Window {
        Window::interval(start, start + 60)
    }

    #[test]
    fn test_timer_poll_order() {
        let mut service = TimerService::new();

        service.register(1u32, window(0), TimeDomain::EventTime, 100);
        service.register(2u32, window(0), TimeDomain::EventTime, 50);
        service.register(3u32, window(0), TimeDomain::EventTime, 150);

        let fired = service.poll(TimeDomain::EventTime, 75);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].key, 2);

        let fired = service.poll(TimeDomain::EventTime, 200);
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].timestamp, 100);
        assert_eq!(fired[1].timestamp, 150);
        assert_eq!(service.pending_count(), 0);
    }

    #[test]
    fn test_timer_same_timestamp_fifo() {
        let mut service = TimerService::new();
        service.register("a", window(0), TimeDomain::EventTime, 10);
        service.register("b", window(0), TimeDomain::EventTime, 10);

        let fired = service.poll(TimeDomain::EventTime, 10);
        let keys: Vec<_> = fired.iter().map(|t| t.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_timer_duplicate_registration_ignored() {
        let mut service = TimerService::new();
        assert!(service.register("k", window(0), TimeDomain::EventTime, 60));
        assert!(!service.register("k", window(0), TimeDomain::EventTime, 60));
        assert_eq!(service.pending_count(), 1);

        let fired = service.poll(TimeDomain::EventTime, 60);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_timer_domains_are_independent() {
        let mut service = TimerService::new();
        service.register("k", window(0), TimeDomain::EventTime, 60);
        service.register("k", window(0), TimeDomain::ProcessingTime, 10);

        assert!(service.poll(TimeDomain::EventTime, 30).is_empty());
        let fired = service.poll(TimeDomain::ProcessingTime, 30);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].domain, TimeDomain::ProcessingTime);
        assert_eq!(service.pending_count(), 1);
    }

    #[test]
    fn test_cancel_window_drops_pending_timers() {
        let mut service = TimerService::new();
        service.register("k", window(0), TimeDomain::EventTime, 60);
        service.register("k", window(0), TimeDomain::EventTime, 70);
        service.register("k", window(60), TimeDomain::EventTime, 120);

        let cancelled = service.cancel_window(&"k", &window(0));
        assert_eq!(cancelled.len(), 2);
        assert_eq!(service.pending_count(), 1);

        let fired = service.poll(TimeDomain::EventTime, 1000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].window, window(60));
    }

    #[test]
    fn test_reregister_after_cancel_fires_once() {
        let mut service = TimerService::new();
        service.register("k", window(0), TimeDomain::EventTime, 60);
        assert!(service.cancel(&"k", &window(0), TimeDomain::EventTime, 60));
        assert!(service.register("k", window(0), TimeDomain::EventTime, 60));

        let fired = service.poll(TimeDomain::EventTime, 60);
        assert_eq!(fired.len(), 1);
        assert!(service.poll(TimeDomain::EventTime, 60).is_empty());
    }

    #[test]
    fn test_cancelled_entries_are_compacted() {
        let mut service = TimerService::new();
        for start in 0..2_000 {
            service.register("k", window(start * 60), TimeDomain::EventTime, start * 60 + 60);
        }
        for start in 1..2_000 {
            service.cancel_window(&"k", &window(start * 60));
        }
        assert_eq!(service.pending_count(), 1);
        assert!(service.event_time.len() <= COMPACT_MIN_QUEUED);

        // Re-registered timers survive compaction and fire once
        service.register("k", window(60), TimeDomain::EventTime, 120);
        assert!(service.cancel(&"k", &window(60), TimeDomain::EventTime, 120));
        assert!(service.register("k", window(60), TimeDomain::EventTime, 120));
        service.compact();
        assert_eq!(service.event_time.len(), 2);

        let fired = service.poll(TimeDomain::EventTime, i64::MAX);
        let timestamps: Vec<i64> = fired.iter().map(|t| t.timestamp).collect();
        assert_eq!(timestamps, vec![60, 120]);
        assert_eq!(service.pending_count(), 0);
    }
}
