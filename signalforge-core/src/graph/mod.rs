//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between signals, computeds and effects.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent signals (sources), computeds (cached derivations) or
//!   effects (sinks)
//! - Edges represent reads: if A read B during its last evaluation, B is in
//!   `A.dependencies` and A is in `B.subscribers`
//!
//! When a signal changes it is queued in the [`Scheduler`]. A flush walks the
//! subscriber edges from everything queued and visits the reached nodes in
//! topological height order.
//!
//! # Design Decisions
//!
//! 1. The graph is centralized rather than spread across the value handles:
//!    - It enables height ordering for batched updates
//!    - It makes cycle detection a graph walk
//!    - Handles can be dropped without leaving dangling edges behind
//!
//! 2. The graph is indexed by node ID for O(1) lookups.
//!
//! 3. Both directions of every edge are stored and kept symmetric.

mod node;
mod scheduler;
mod store;

pub use node::{Node, NodeId, NodeKind};
pub use scheduler::{plan_flush, Scheduler, SchedulerState};
pub use store::{EdgeDiff, Graph};
