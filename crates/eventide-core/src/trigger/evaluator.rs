//! Trigger evaluation.
//!
//! A [`Trigger`] tree is compiled once into a flat pre-order plan. Each plan
//! node records its kind, its children and the index one past its subtree,
//! so a subtree of the matching [`TriggerState`] is a contiguous range.
//! Evaluation is plain structural recursion over the plan.

use smallvec::SmallVec;

use super::state::{NodeData, NodeState, TriggerState};
use super::{Trigger, TriggerResult};
use crate::engine::ConfigError;
use crate::time::TimeDomain;
use crate::window::Window;

/// Timers requested by a trigger state.
pub type TimerRequests = SmallVec<[(TimeDomain, i64); 4]>;

/// Inputs a trigger reads while being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext {
    /// Window the state belongs to
    pub window: Window,
    /// Current input watermark
    pub watermark: i64,
    /// Current processing time
    pub processing_time: i64,
}

impl TriggerContext {
    fn window_end(&self) -> i64 {
        self.window.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Watermark { offset: i64 },
    EndOfWindow { early: Option<usize>, late: Option<usize> },
    ElementCount(u64),
    ProcessingTime(i64),
    Never,
    Repeatedly,
    AfterFirst,
    AfterAll,
    AfterEach,
    OrFinally,
}

#[derive(Debug, Clone)]
struct PlanNode {
    kind: NodeKind,
    children: SmallVec<[usize; 4]>,
    /// One past the last node of this subtree
    end: usize,
}

/// Compiled trigger, shared by every window of a grouping operation.
///
/// # Example
///
/// ```rust
/// use eventide_core::trigger::{Trigger, TriggerContext, TriggerEvaluator};
/// use eventide_core::trigger::TriggerResult;
/// use eventide_core::window::Window;
///
/// let evaluator = TriggerEvaluator::new(&Trigger::after_count(2)).unwrap();
/// let mut state = evaluator.new_state();
/// let ctx = TriggerContext {
///     window: Window::interval(0, 60),
///     watermark: i64::MIN,
///     processing_time: 0,
/// };
///
/// evaluator.on_element(&mut state, &ctx);
/// assert_eq!(evaluator.evaluate(&mut state, &ctx), TriggerResult::Continue);
/// evaluator.on_element(&mut state, &ctx);
/// assert_eq!(evaluator.evaluate(&mut state, &ctx), TriggerResult::FireAndFinish);
/// ```
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    plan: Vec<PlanNode>,
}

impl TriggerEvaluator {
    /// Validates and compiles a trigger tree.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] reported by [`Trigger::validate`].
    pub fn new(trigger: &Trigger) -> Result<Self, ConfigError> {
        trigger.validate()?;
        let mut plan = Vec::new();
        compile(trigger, &mut plan);
        Ok(Self { plan })
    }

    /// Returns the number of nodes in the compiled plan.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.plan.len()
    }

    /// Creates the initial state for a new window.
    #[must_use]
    pub fn new_state(&self) -> TriggerState {
        TriggerState::from_nodes(self.plan.iter().map(initial_node).collect())
    }

    /// Feeds one element to the trigger.
    pub fn on_element(&self, state: &mut TriggerState, ctx: &TriggerContext) {
        self.element(0, &mut state.nodes, ctx);
    }

    /// Checks whether the trigger should fire and, if so, applies the firing.
    ///
    /// Returns [`TriggerResult::FireAndFinish`] if the root finished with this
    /// firing.
    pub fn evaluate(&self, state: &mut TriggerState, ctx: &TriggerContext) -> TriggerResult {
        if self.plan.is_empty() || !self.should_fire(0, &state.nodes, ctx) {
            return TriggerResult::Continue;
        }
        self.fire(0, &mut state.nodes, ctx);
        if state.is_finished() {
            TriggerResult::FireAndFinish
        } else {
            TriggerResult::Fire
        }
    }

    /// Returns the timers the state currently depends on.
    ///
    /// Registering them with a timer service guarantees the engine re-checks
    /// the trigger whenever one of its conditions can become true because
    /// time advanced.
    #[must_use]
    pub fn timers(&self, state: &TriggerState, window: &Window) -> TimerRequests {
        let mut timers = TimerRequests::new();
        for (node, s) in self.plan.iter().zip(&state.nodes) {
            if s.finished {
                continue;
            }
            match (node.kind, s.data) {
                (NodeKind::Watermark { offset }, _) => {
                    timers.push((TimeDomain::EventTime, window.end().saturating_add(offset)));
                }
                (NodeKind::EndOfWindow { .. }, NodeData::PastEnd(false)) => {
                    timers.push((TimeDomain::EventTime, window.end()));
                }
                (NodeKind::ProcessingTime(_), NodeData::Deadline(Some(deadline))) => {
                    timers.push((TimeDomain::ProcessingTime, deadline));
                }
                _ => {}
            }
        }
        timers
    }

    /// Combines the states of windows being merged into `ctx.window`.
    ///
    /// Node-wise: finished if finished in any source, counts are summed, the
    /// earliest processing-time deadline wins, and the end-of-window firing
    /// only counts as done if the merged window end has also passed.
    #[must_use]
    pub fn merge_states(&self, sources: &[&TriggerState], ctx: &TriggerContext) -> TriggerState {
        let mut merged = self.new_state();
        for (i, slot) in merged.nodes.iter_mut().enumerate() {
            for source in sources {
                let Some(other) = source.nodes.get(i) else {
                    continue;
                };
                slot.finished |= other.finished;
                slot.data = match (slot.data, other.data) {
                    (NodeData::Count(a), NodeData::Count(b)) => NodeData::Count(a.saturating_add(b)),
                    (NodeData::Deadline(a), NodeData::Deadline(b)) => NodeData::Deadline(match (a, b) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    }),
                    (NodeData::PastEnd(a), NodeData::PastEnd(b)) => NodeData::PastEnd(a || b),
                    (data, _) => data,
                };
            }
            if let NodeData::PastEnd(past) = slot.data {
                slot.data = NodeData::PastEnd(past && ctx.watermark >= ctx.window_end());
            }
        }
        merged
    }

    fn element(&self, i: usize, nodes: &mut [NodeState], ctx: &TriggerContext) {
        if nodes[i].finished {
            return;
        }
        let node = &self.plan[i];
        match node.kind {
            NodeKind::ElementCount(_) => {
                if let NodeData::Count(count) = &mut nodes[i].data {
                    *count = count.saturating_add(1);
                }
            }
            NodeKind::ProcessingTime(delay) => {
                if let NodeData::Deadline(deadline @ None) = &mut nodes[i].data {
                    *deadline = Some(ctx.processing_time.saturating_add(delay));
                }
            }
            NodeKind::EndOfWindow { early, late } => {
                let phase = if nodes[i].data == NodeData::PastEnd(true) {
                    late
                } else {
                    early
                };
                if let Some(child) = phase {
                    self.element(child, nodes, ctx);
                }
            }
            NodeKind::AfterEach => {
                if let Some(child) = self.current_child(i, nodes) {
                    self.element(child, nodes, ctx);
                }
            }
            NodeKind::Repeatedly | NodeKind::AfterFirst | NodeKind::AfterAll | NodeKind::OrFinally => {
                for &child in &node.children {
                    self.element(child, nodes, ctx);
                }
            }
            NodeKind::Watermark { .. } | NodeKind::Never => {}
        }
    }

    fn should_fire(&self, i: usize, nodes: &[NodeState], ctx: &TriggerContext) -> bool {
        if nodes[i].finished {
            return false;
        }
        let node = &self.plan[i];
        match node.kind {
            NodeKind::Watermark { offset } => {
                ctx.watermark >= ctx.window_end().saturating_add(offset)
            }
            NodeKind::EndOfWindow { early, late } => {
                if nodes[i].data == NodeData::PastEnd(true) {
                    late.is_some_and(|child| self.should_fire(child, nodes, ctx))
                } else {
                    ctx.watermark >= ctx.window_end()
                        || early.is_some_and(|child| self.should_fire(child, nodes, ctx))
                }
            }
            NodeKind::ElementCount(n) => matches!(nodes[i].data, NodeData::Count(c) if c >= n),
            NodeKind::ProcessingTime(_) => matches!(
                nodes[i].data,
                NodeData::Deadline(Some(deadline)) if ctx.processing_time >= deadline
            ),
            NodeKind::Never => false,
            NodeKind::Repeatedly => self.should_fire(node.children[0], nodes, ctx),
            NodeKind::AfterFirst => node
                .children
                .iter()
                .any(|&child| self.should_fire(child, nodes, ctx)),
            NodeKind::AfterAll => node
                .children
                .iter()
                .all(|&child| nodes[child].finished || self.should_fire(child, nodes, ctx)),
            NodeKind::AfterEach => self
                .current_child(i, nodes)
                .is_some_and(|child| self.should_fire(child, nodes, ctx)),
            NodeKind::OrFinally => {
                self.should_fire(node.children[0], nodes, ctx)
                    || self.should_fire(node.children[1], nodes, ctx)
            }
        }
    }

    /// Applies a firing to node `i`. Only called when `should_fire(i)` holds.
    fn fire(&self, i: usize, nodes: &mut [NodeState], ctx: &TriggerContext) {
        let node = &self.plan[i];
        match node.kind {
            NodeKind::Watermark { .. } | NodeKind::ElementCount(_) | NodeKind::ProcessingTime(_) => {
                nodes[i].finished = true;
            }
            NodeKind::Never => {}
            NodeKind::EndOfWindow { early, late } => {
                if nodes[i].data == NodeData::PastEnd(true) {
                    if let Some(child) = late {
                        self.fire(child, nodes, ctx);
                        self.reset(child, nodes);
                    }
                } else if ctx.watermark >= ctx.window_end() {
                    nodes[i].data = NodeData::PastEnd(true);
                    match late {
                        Some(child) => self.reset(child, nodes),
                        None => nodes[i].finished = true,
                    }
                } else if let Some(child) = early {
                    self.fire(child, nodes, ctx);
                    self.reset(child, nodes);
                }
            }
            NodeKind::Repeatedly => {
                let child = node.children[0];
                self.fire(child, nodes, ctx);
                self.reset(child, nodes);
            }
            NodeKind::AfterFirst | NodeKind::AfterAll => {
                for &child in &node.children {
                    if self.should_fire(child, nodes, ctx) {
                        self.fire(child, nodes, ctx);
                    }
                }
                nodes[i].finished = true;
            }
            NodeKind::AfterEach => {
                if let Some(child) = self.current_child(i, nodes) {
                    self.fire(child, nodes, ctx);
                }
                if self.current_child(i, nodes).is_none() {
                    nodes[i].finished = true;
                }
            }
            NodeKind::OrFinally => {
                let (main, finally) = (node.children[0], node.children[1]);
                if self.should_fire(finally, nodes, ctx) {
                    self.fire(finally, nodes, ctx);
                    nodes[i].finished = true;
                } else {
                    self.fire(main, nodes, ctx);
                    if nodes[main].finished {
                        nodes[i].finished = true;
                    }
                }
            }
        }
    }

    fn current_child(&self, i: usize, nodes: &[NodeState]) -> Option<usize> {
        self.plan[i]
            .children
            .iter()
            .copied()
            .find(|&child| !nodes[child].finished)
    }

    fn reset(&self, i: usize, nodes: &mut [NodeState]) {
        for j in i..self.plan[i].end {
            nodes[j] = initial_node(&self.plan[j]);
        }
    }
}

fn initial_node(node: &PlanNode) -> NodeState {
    NodeState::new(match node.kind {
        NodeKind::ElementCount(_) => NodeData::Count(0),
        NodeKind::ProcessingTime(_) => NodeData::Deadline(None),
        NodeKind::EndOfWindow { .. } => NodeData::PastEnd(false),
        _ => NodeData::None,
    })
}

/// Appends `trigger` to `plan` in pre-order and returns its index.
fn compile(trigger: &Trigger, plan: &mut Vec<PlanNode>) -> usize {
    let index = plan.len();
    plan.push(PlanNode {
        kind: NodeKind::Never,
        children: SmallVec::new(),
        end: index + 1,
    });

    let mut children = SmallVec::new();
    let kind = match trigger {
        Trigger::AfterWatermarkPasses(boundary) => NodeKind::Watermark {
            offset: boundary.offset_ms(),
        },
        Trigger::AfterEndOfWindow { early, late } => {
            let early = early.as_deref().map(|t| compile(t, plan));
            let late = late.as_deref().map(|t| compile(t, plan));
            children.extend(early);
            children.extend(late);
            NodeKind::EndOfWindow { early, late }
        }
        Trigger::AfterElementCount(n) => NodeKind::ElementCount(*n),
        Trigger::AfterProcessingTime(delay) => NodeKind::ProcessingTime(*delay),
        Trigger::Never => NodeKind::Never,
        Trigger::Repeatedly(child) => {
            children.push(compile(child, plan));
            NodeKind::Repeatedly
        }
        Trigger::AfterFirst(list) | Trigger::AfterAll(list) | Trigger::AfterEach(list) => {
            for child in list {
                children.push(compile(child, plan));
            }
            match trigger {
                Trigger::AfterFirst(_) => NodeKind::AfterFirst,
                Trigger::AfterAll(_) => NodeKind::AfterAll,
                _ => NodeKind::AfterEach,
            }
        }
        Trigger::OrFinally(main, finally) => {
            children.push(compile(main, plan));
            children.push(compile(finally, plan));
            NodeKind::OrFinally
        }
    };

    let end = plan.len();
    let node = &mut plan[index];
    node.kind = kind;
    node.children = children;
    node.end = end;
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(watermark: i64, processing_time: i64) -> TriggerContext {
        TriggerContext {
            window: Window::interval(0, 60),
            watermark,
            processing_time,
        }
    }

    fn evaluator(trigger: Trigger) -> TriggerEvaluator {
        TriggerEvaluator::new(&trigger).unwrap()
    }

    #[test]
    fn test_watermark_trigger_fires_once() {
        let ev = evaluator(Trigger::after_watermark());
        let mut state = ev.new_state();

        assert_eq!(ev.evaluate(&mut state, &ctx(59, 0)), TriggerResult::Continue);
        assert_eq!(
            ev.evaluate(&mut state, &ctx(60, 0)),
            TriggerResult::FireAndFinish
        );
        assert!(state.is_finished());
        assert_eq!(ev.evaluate(&mut state, &ctx(100, 0)), TriggerResult::Continue);
    }

    #[test]
    fn test_watermark_offset() {
        let ev = evaluator(Trigger::after_watermark_plus(15));
        let mut state = ev.new_state();
        assert_eq!(ev.evaluate(&mut state, &ctx(74, 0)), TriggerResult::Continue);
        assert_eq!(
            ev.evaluate(&mut state, &ctx(75, 0)),
            TriggerResult::FireAndFinish
        );
        assert_eq!(
            ev.timers(&ev.new_state(), &Window::interval(0, 60)).as_slice(),
            &[(TimeDomain::EventTime, 75)]
        );
    }

    #[test]
    fn test_repeatedly_count_rearms() {
        let ev = evaluator(Trigger::repeatedly(Trigger::after_count(2)));
        let mut state = ev.new_state();
        let c = ctx(i64::MIN, 0);

        let mut results = Vec::new();
        for _ in 0..5 {
            ev.on_element(&mut state, &c);
            results.push(ev.evaluate(&mut state, &c));
        }
        assert_eq!(
            results,
            vec![
                TriggerResult::Continue,
                TriggerResult::Fire,
                TriggerResult::Continue,
                TriggerResult::Fire,
                TriggerResult::Continue,
            ]
        );
        assert!(!state.is_finished());
    }

    #[test]
    fn test_processing_time_deadline() {
        let ev = evaluator(Trigger::after_processing_time(100));
        let mut state = ev.new_state();

        ev.on_element(&mut state, &ctx(i64::MIN, 1000));
        // A second element does not move the deadline
        ev.on_element(&mut state, &ctx(i64::MIN, 1050));
        assert_eq!(
            ev.timers(&state, &Window::interval(0, 60)).as_slice(),
            &[(TimeDomain::ProcessingTime, 1100)]
        );

        assert_eq!(ev.evaluate(&mut state, &ctx(i64::MIN, 1099)), TriggerResult::Continue);
        assert_eq!(
            ev.evaluate(&mut state, &ctx(i64::MIN, 1100)),
            TriggerResult::FireAndFinish
        );
    }

    #[test]
    fn test_after_first_and_after_all() {
        let first = evaluator(Trigger::after_first(vec![
            Trigger::after_count(3),
            Trigger::after_watermark(),
        ]));
        let mut state = first.new_state();
        first.on_element(&mut state, &ctx(0, 0));
        assert_eq!(
            first.evaluate(&mut state, &ctx(60, 0)),
            TriggerResult::FireAndFinish
        );

        let all = evaluator(Trigger::after_all(vec![
            Trigger::after_count(1),
            Trigger::after_watermark(),
        ]));
        let mut state = all.new_state();
        all.on_element(&mut state, &ctx(0, 0));
        assert_eq!(all.evaluate(&mut state, &ctx(10, 0)), TriggerResult::Continue);
        assert_eq!(
            all.evaluate(&mut state, &ctx(60, 0)),
            TriggerResult::FireAndFinish
        );
    }

    #[test]
    fn test_after_each_sequence() {
        let ev = evaluator(Trigger::after_each(vec![
            Trigger::after_count(1),
            Trigger::after_count(2),
        ]));
        let mut state = ev.new_state();
        let c = ctx(0, 0);

        ev.on_element(&mut state, &c);
        assert_eq!(ev.evaluate(&mut state, &c), TriggerResult::Fire);
        ev.on_element(&mut state, &c);
        assert_eq!(ev.evaluate(&mut state, &c), TriggerResult::Continue);
        ev.on_element(&mut state, &c);
        assert_eq!(ev.evaluate(&mut state, &c), TriggerResult::FireAndFinish);
    }

    #[test]
    fn test_or_finally() {
        let ev = evaluator(
            Trigger::repeatedly(Trigger::after_count(1)).or_finally(Trigger::after_watermark()),
        );
        let mut state = ev.new_state();

        ev.on_element(&mut state, &ctx(0, 0));
        assert_eq!(ev.evaluate(&mut state, &ctx(0, 0)), TriggerResult::Fire);
        ev.on_element(&mut state, &ctx(0, 0));
        assert_eq!(ev.evaluate(&mut state, &ctx(0, 0)), TriggerResult::Fire);
        assert_eq!(
            ev.evaluate(&mut state, &ctx(60, 0)),
            TriggerResult::FireAndFinish
        );
    }

    #[test]
    fn test_end_of_window_early_and_late() {
        let ev = evaluator(
            Trigger::after_end_of_window()
                .with_early_firings(Trigger::after_count(2))
                .with_late_firings(Trigger::after_count(1)),
        );
        let mut state = ev.new_state();

        // Early phase
        ev.on_element(&mut state, &ctx(10, 0));
        assert_eq!(ev.evaluate(&mut state, &ctx(10, 0)), TriggerResult::Continue);
        ev.on_element(&mut state, &ctx(10, 0));
        assert_eq!(ev.evaluate(&mut state, &ctx(10, 0)), TriggerResult::Fire);

        // On time
        ev.on_element(&mut state, &ctx(20, 0));
        assert_eq!(ev.evaluate(&mut state, &ctx(60, 0)), TriggerResult::Fire);
        assert_eq!(ev.evaluate(&mut state, &ctx(61, 0)), TriggerResult::Continue);

        // Late firings re-arm
        ev.on_element(&mut state, &ctx(65, 0));
        assert_eq!(ev.evaluate(&mut state, &ctx(65, 0)), TriggerResult::Fire);
        ev.on_element(&mut state, &ctx(66, 0));
        assert_eq!(ev.evaluate(&mut state, &ctx(66, 0)), TriggerResult::Fire);
        assert!(!state.is_finished());
    }

    #[test]
    fn test_end_of_window_without_late_finishes() {
        let ev = evaluator(Trigger::after_end_of_window());
        let mut state = ev.new_state();
        assert_eq!(
            ev.evaluate(&mut state, &ctx(60, 0)),
            TriggerResult::FireAndFinish
        );
    }

    #[test]
    fn test_never() {
        let ev = evaluator(Trigger::Never);
        let mut state = ev.new_state();
        ev.on_element(&mut state, &ctx(0, 0));
        assert_eq!(ev.evaluate(&mut state, &ctx(i64::MAX, i64::MAX)), TriggerResult::Continue);
        assert!(ev.timers(&state, &Window::interval(0, 60)).is_empty());
    }

    #[test]
    fn test_plan_layout() {
        let ev = evaluator(
            Trigger::repeatedly(Trigger::after_first(vec![
                Trigger::after_count(2),
                Trigger::after_processing_time(10),
            ]))
            .or_finally(Trigger::after_watermark()),
        );
        // OrFinally, Repeatedly, AfterFirst, Count, ProcessingTime, Watermark
        assert_eq!(ev.node_count(), 6);
        assert_eq!(ev.plan[0].end, 6);
        assert_eq!(ev.plan[1].end, 5);
        assert_eq!(ev.plan[0].children.as_slice(), &[1, 5]);
    }

    #[test]
    fn test_merge_states() {
        let ev = evaluator(Trigger::repeatedly(Trigger::after_first(vec![
            Trigger::after_count(5),
            Trigger::after_processing_time(100),
        ])));
        let mut a = ev.new_state();
        let mut b = ev.new_state();
        for _ in 0..2 {
            ev.on_element(&mut a, &ctx(0, 1000));
        }
        for _ in 0..2 {
            ev.on_element(&mut b, &ctx(0, 900));
        }

        let merged = ev.merge_states(&[&a, &b], &ctx(0, 1000));
        assert_eq!(merged.nodes()[2].data, NodeData::Count(4));
        assert_eq!(merged.nodes()[3].data, NodeData::Deadline(Some(1000)));
        assert!(!merged.is_finished());
    }

    #[test]
    fn test_merge_states_past_end_recomputed() {
        let ev = evaluator(Trigger::after_end_of_window().with_late_firings(Trigger::after_count(1)));
        let mut a = ev.new_state();
        ev.evaluate(&mut a, &ctx(60, 0));
        assert_eq!(a.nodes()[0].data, NodeData::PastEnd(true));

        // The merged window ends later than the watermark
        let merged_ctx = TriggerContext {
            window: Window::interval(0, 120),
            watermark: 60,
            processing_time: 0,
        };
        let merged = ev.merge_states(&[&a, &ev.new_state()], &merged_ctx);
        assert_eq!(merged.nodes()[0].data, NodeData::PastEnd(false));
    }
}
