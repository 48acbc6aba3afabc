//! Graph Store
//!
//! Owns every node of a runtime and keeps the two directions of each edge in
//! sync. All edge mutation goes through here: `add_edge`/`remove_edge`, the
//! diff-and-replace step that ends a tracked evaluation, and disposal.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeKind};

/// Edges added and removed by [`Graph::replace_dependencies`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EdgeDiff {
    pub added: SmallVec<[NodeId; 4]>,
    pub removed: SmallVec<[NodeId; 4]>,
}

impl EdgeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The dependency graph.
#[derive(Debug, Default)]
pub struct Graph {
    /// All nodes, indexed by ID. Disposed nodes stay as tombstones until
    /// their last handle goes away (effects included).
    nodes: HashMap<NodeId, Node>,

    /// Logical clock handing out versions.
    clock: u64,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node of the given kind and return its ID.
    pub fn insert(&mut self, kind: NodeKind) -> NodeId {
        self.insert_node(Node::new(kind))
    }

    /// Add an existing node to the graph.
    pub fn insert_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable reference to a node.
    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    /// Whether the node exists and has not been disposed.
    pub fn is_live(&self, node_id: NodeId) -> bool {
        self.nodes
            .get(&node_id)
            .is_some_and(|node| !node.is_disposed())
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.values().filter(|node| !node.is_disposed()).count()
    }

    /// Advance the logical clock and return the new time.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Record an accepted change (or evaluation) of a node.
    ///
    /// Returns the node's new version.
    pub fn record_change(&mut self, node_id: NodeId) -> Option<u64> {
        let version = self.tick();
        let node = self.nodes.get_mut(&node_id)?;
        node.bump_version(version);
        Some(node.version())
    }

    /// Add a dependency edge: `dependent` reads from `dependency`.
    ///
    /// Edges touching a missing or disposed node are refused.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) -> bool {
        if dependency == dependent || !self.is_live(dependency) || !self.is_live(dependent) {
            return false;
        }

        let added = self
            .nodes
            .get_mut(&dependency)
            .is_some_and(|node| node.add_subscriber(dependent));
        if let Some(node) = self.nodes.get_mut(&dependent) {
            node.add_dependency(dependency);
        }
        added
    }

    /// Remove a dependency edge.
    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(node) = self.nodes.get_mut(&dependency) {
            node.remove_subscriber(dependent);
        }
        if let Some(node) = self.nodes.get_mut(&dependent) {
            node.remove_dependency(dependency);
        }
    }

    /// Replace the dependencies of `node_id` with `next`.
    ///
    /// Edges that were not re-established are severed, new ones are added,
    /// and edges present in both sets are left untouched.
    pub fn replace_dependencies(&mut self, node_id: NodeId, next: &IndexSet<NodeId>) -> EdgeDiff {
        let mut diff = EdgeDiff::default();
        let Some(node) = self.nodes.get(&node_id) else {
            return diff;
        };
        if node.is_disposed() {
            return diff;
        }

        let stale: SmallVec<[NodeId; 4]> = node
            .dependencies()
            .iter()
            .filter(|dep| !next.contains(*dep))
            .copied()
            .collect();
        for dep in stale {
            self.remove_edge(dep, node_id);
            diff.removed.push(dep);
        }

        for &dep in next {
            if self.add_edge(dep, node_id) {
                diff.added.push(dep);
            }
        }

        diff
    }

    /// Dispose a node, severing every edge that touches it.
    ///
    /// The node stays behind as a tombstone so later operations on it can be
    /// reported as use-after-dispose. Returns `false` if it was already gone.
    pub fn dispose(&mut self, node_id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return false;
        };
        if node.is_disposed() {
            return false;
        }

        let (dependencies, subscribers) = node.dispose();
        self.sever(node_id, &dependencies, &subscribers);
        true
    }

    /// Remove a node entirely, severing every edge that touches it.
    pub fn remove(&mut self, node_id: NodeId) -> Option<Node> {
        let mut node = self.nodes.remove(&node_id)?;
        let (dependencies, subscribers) = node.dispose();
        self.sever(node_id, &dependencies, &subscribers);
        Some(node)
    }

    fn sever(&mut self, node_id: NodeId, dependencies: &IndexSet<NodeId>, subscribers: &IndexSet<NodeId>) {
        for dep_id in dependencies {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_subscriber(node_id);
            }
        }
        for sub_id in subscribers {
            if let Some(sub) = self.nodes.get_mut(sub_id) {
                sub.remove_dependency(node_id);
            }
        }
        // Its input vanished; everything downstream must re-evaluate.
        self.invalidate(subscribers.iter().copied());
    }

    /// Mark `roots` and every node downstream of them dirty, signals
    /// excepted. Returns the number of nodes newly marked.
    ///
    /// Used wherever changes leave the graph without a flush visiting their
    /// subscribers.
    pub fn invalidate(&mut self, roots: impl IntoIterator<Item = NodeId>) -> usize {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = roots.into_iter().collect();
        let mut marked = 0;

        while let Some(node_id) = stack.pop() {
            if !seen.insert(node_id) {
                continue;
            }
            let Some(node) = self.nodes.get_mut(&node_id) else {
                continue;
            };
            if node.is_disposed() {
                continue;
            }
            if node.kind() != NodeKind::Signal && !node.is_dirty() {
                node.mark_dirty();
                marked += 1;
            }
            stack.extend(node.subscribers().iter().copied());
        }
        marked
    }

    /// Mark a node dirty. Returns `false` for missing or disposed nodes.
    pub fn mark_dirty(&mut self, node_id: NodeId) -> bool {
        match self.nodes.get_mut(&node_id) {
            Some(node) if !node.is_disposed() => {
                node.mark_dirty();
                true
            }
            _ => false,
        }
    }

    /// Whether a derived node must be re-evaluated before its cache is used.
    ///
    /// A node is stale when it is dirty, or when any dependency carries a
    /// newer version than the node itself, or when a computed dependency is
    /// itself stale. This catches writes whose notification is still waiting
    /// in an open batch.
    pub fn is_stale(&self, node_id: NodeId) -> bool {
        if self.is_stale_shallow(node_id) {
            return true;
        }
        let mut visited = HashSet::new();
        self.is_stale_inner(node_id, &mut visited)
    }

    /// Staleness judged from the node's own flag and its direct dependencies.
    ///
    /// Exact while no change is waiting for a flush: a flush leaves every
    /// stale node downstream of a change marked dirty.
    pub fn is_stale_shallow(&self, node_id: NodeId) -> bool {
        let Some(node) = self.nodes.get(&node_id) else {
            return true;
        };
        node.is_dirty()
            || node
                .dependencies()
                .iter()
                .any(|dep_id| self.nodes.get(dep_id).map_or(true, |dep| dep.version() > node.version()))
    }

    fn is_stale_inner(&self, node_id: NodeId, visited: &mut HashSet<NodeId>) -> bool {
        let Some(node) = self.nodes.get(&node_id) else {
            return true;
        };
        if node.is_dirty() {
            return true;
        }
        if !visited.insert(node_id) {
            return false;
        }

        node.dependencies().iter().any(|dep_id| {
            let Some(dep) = self.nodes.get(dep_id) else {
                return true;
            };
            dep.version() > node.version()
                || (dep.kind() == NodeKind::Computed && self.is_stale_inner(*dep_id, visited))
        })
    }
}
