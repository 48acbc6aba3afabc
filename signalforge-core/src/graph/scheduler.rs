//! Update Scheduler
//!
//! The scheduler decides *when* dirty nodes are processed and *in which
//! order*. It never runs user code itself; the runtime drives the flush and
//! asks the scheduler for the plan.
//!
//! # State machine
//!
//! ```text
//! Idle --batch--> Batching(1) --batch--> Batching(2) ...
//! Batching(1) --close--> Flushing --done--> Idle
//! ```
//!
//! Writes always land in the pending set. Only closing the outermost batch
//! (or a write while idle, which is an implicit one-write batch) starts a
//! flush.
//!
//! # Ordering
//!
//! A flush round visits every node reachable from the pending set through
//! subscriber edges, in non-decreasing topological height:
//!
//! - `height(node) = 0` if the node has no dependencies
//! - `height(node) = 1 + max(height(dep))` otherwise
//!
//! Dependencies therefore come before dependents, and a node reached through
//! several paths (a diamond) is visited once.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexSet;

use super::node::NodeId;
use super::store::Graph;
use crate::error::{ReactiveError, Result};

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing is batching or flushing.
    Idle,

    /// Inside `depth` nested batches.
    Batching(usize),

    /// A flush is running.
    Flushing,
}

/// The update scheduler.
#[derive(Debug)]
pub struct Scheduler {
    state: SchedulerState,

    /// Nodes whose value changed and whose subscribers still need a visit.
    pending: IndexSet<NodeId>,
}

impl Scheduler {
    /// Create an idle scheduler with nothing pending.
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Idle,
            pending: IndexSet::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_batching(&self) -> bool {
        matches!(self.state, SchedulerState::Batching(_))
    }

    pub fn is_flushing(&self) -> bool {
        self.state == SchedulerState::Flushing
    }

    /// Enter a batch. Nested batches only deepen the current one; a batch
    /// opened during a flush just groups writes for that flush.
    pub fn begin_batch(&mut self) {
        self.state = match self.state {
            SchedulerState::Idle => SchedulerState::Batching(1),
            SchedulerState::Batching(depth) => SchedulerState::Batching(depth + 1),
            SchedulerState::Flushing => SchedulerState::Flushing,
        };
    }

    /// Leave a batch.
    ///
    /// Returns `true` when the outermost batch closed with work pending, in
    /// which case the caller must flush.
    pub fn end_batch(&mut self) -> bool {
        match self.state {
            SchedulerState::Batching(1) => {
                self.state = SchedulerState::Idle;
                !self.pending.is_empty()
            }
            SchedulerState::Batching(depth) => {
                self.state = SchedulerState::Batching(depth - 1);
                false
            }
            SchedulerState::Idle | SchedulerState::Flushing => false,
        }
    }

    /// Queue a changed node.
    pub fn enqueue(&mut self, node_id: NodeId) {
        self.pending.insert(node_id);
    }

    /// Drop a node from the pending set (it was disposed).
    pub fn forget(&mut self, node_id: NodeId) {
        self.pending.shift_remove(&node_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Enter the flushing state.
    ///
    /// Returns `false` (and changes nothing) unless the scheduler is idle.
    pub fn start_flush(&mut self) -> bool {
        if self.state != SchedulerState::Idle {
            return false;
        }
        self.state = SchedulerState::Flushing;
        true
    }

    /// Take the pending set for the next flush round.
    pub fn take_pending(&mut self) -> IndexSet<NodeId> {
        std::mem::take(&mut self.pending)
    }

    /// Leave the flushing state.
    pub fn finish_flush(&mut self) {
        self.state = SchedulerState::Idle;
    }

    /// Abandon all pending work.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the visit order for one flush round.
///
/// Collects every live node reachable from `changed` (the changed nodes
/// included), computes their heights and sorts them. Ties keep discovery
/// order. Fails without side effects if a dependency cycle is found.
pub fn plan_flush(graph: &Graph, changed: &IndexSet<NodeId>) -> Result<Vec<NodeId>> {
    let mut reachable: IndexSet<NodeId> = IndexSet::new();
    let mut queue: VecDeque<NodeId> = changed.iter().copied().collect();

    // BFS through subscriber edges
    while let Some(node_id) = queue.pop_front() {
        let Some(node) = graph.get_node(node_id) else {
            continue;
        };
        if node.is_disposed() || !reachable.insert(node_id) {
            continue;
        }
        queue.extend(node.subscribers().iter().copied());
    }

    let mut heights = Heights::default();
    let mut order = Vec::with_capacity(reachable.len());
    for &node_id in &reachable {
        order.push((heights.of(graph, node_id)?, node_id));
    }

    // Stable, so equal heights keep discovery order
    order.sort_by_key(|&(height, _)| height);
    Ok(order.into_iter().map(|(_, node_id)| node_id).collect())
}

/// Memoized height computation with cycle detection.
#[derive(Default)]
struct Heights {
    done: HashMap<NodeId, usize>,
    in_progress: IndexSet<NodeId>,
}

impl Heights {
    fn of(&mut self, graph: &Graph, node_id: NodeId) -> Result<usize> {
        if let Some(&height) = self.done.get(&node_id) {
            return Ok(height);
        }
        if !self.in_progress.insert(node_id) {
            return Err(ReactiveError::CyclicDependency { node: node_id });
        }

        let mut height = 0;
        if let Some(node) = graph.get_node(node_id) {
            for &dep in node.dependencies() {
                height = height.max(self.of(graph, dep)? + 1);
            }
        }

        self.in_progress.shift_remove(&node_id);
        self.done.insert(node_id, height);
        Ok(height)
    }
}
