//! Window merging.
//!
//! Merging windows (sessions) are reconciled per key by computing the
//! transitive closure of "overlaps after extending by the slack". Candidate
//! overlaps come from a sweep over the windows sorted by start; the closure
//! is maintained with a union-find so the result does not depend on the
//! order in which windows were opened.

use smallvec::SmallVec;

use super::Window;

/// Disjoint-set forest over `0..n` with path halving and union by rank.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    /// Creates `n` singleton sets.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    /// Returns the representative of the set containing `x`.
    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merges the sets containing `a` and `b`.
    ///
    /// Returns `false` if they were already in the same set.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }
}

/// A set of windows that collapse into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeGroup {
    /// Windows being merged, sorted
    pub sources: SmallVec<[Window; 4]>,
    /// The merged window (span of all sources)
    pub result: Window,
}

/// Computes the merges needed to bring `windows` to a fixed point.
///
/// Two interval windows `a` and `b` belong together when
/// `a.start < b.end + slack && b.start < a.end + slack`; the relation is
/// closed transitively. Only groups of two or more windows are returned.
/// The global window never merges.
///
/// # Example
///
/// ```rust
/// use eventide_core::window::{merge_windows, Window};
///
/// let groups = merge_windows(
///     &[Window::interval(0, 30), Window::interval(10, 40), Window::interval(50, 80)],
///     30,
/// );
/// assert_eq!(groups.len(), 1);
/// assert_eq!(groups[0].result, Window::interval(0, 80));
/// ```
#[must_use]
pub fn merge_windows(windows: &[Window], slack: i64) -> Vec<MergeGroup> {
    let mut intervals: Vec<Window> = windows
        .iter()
        .copied()
        .filter(|w| matches!(w, Window::Interval { .. }))
        .collect();
    intervals.sort_unstable();
    intervals.dedup();
    if intervals.len() < 2 {
        return Vec::new();
    }

    let mut sets = UnionFind::new(intervals.len());
    // Sweep: each window joins the running group if it starts before the
    // group's furthest end plus slack.
    let mut anchor = 0;
    let mut reach = intervals[0].end();
    for (i, window) in intervals.iter().enumerate().skip(1) {
        if window.start() < reach.saturating_add(slack) {
            sets.union(anchor, i);
            reach = reach.max(window.end());
        } else {
            anchor = i;
            reach = window.end();
        }
    }

    let mut groups: Vec<(usize, MergeGroup)> = Vec::new();
    for (i, window) in intervals.iter().enumerate() {
        let root = sets.find(i);
        match groups.iter_mut().find(|(r, _)| *r == root) {
            Some((_, group)) => {
                group.result = group.result.span(window);
                group.sources.push(*window);
            }
            None => {
                let mut sources = SmallVec::new();
                sources.push(*window);
                groups.push((
                    root,
                    MergeGroup {
                        sources,
                        result: *window,
                    },
                ));
            }
        }
    }

    groups
        .into_iter()
        .map(|(_, group)| group)
        .filter(|group| group.sources.len() > 1)
        .collect()
}
