//! Graph Nodes
//!
//! This module defines the metadata every signal, computed and effect keeps
//! in the dependency graph. Values themselves live in the typed handles; the
//! graph only knows identities, versions and edges.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A mutable source. Never has dependencies.
    Signal,

    /// A lazily evaluated, cached derivation.
    Computed,

    /// An eagerly re-run side effect. Never has subscribers.
    Effect,
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,

    /// Logical time of the last accepted change or evaluation.
    version: u64,

    /// Whether a dependency changed since the last evaluation.
    dirty: bool,

    disposed: bool,

    /// Nodes this node read during its last evaluation.
    dependencies: IndexSet<NodeId>,

    /// Nodes that read this node during their last evaluation.
    subscribers: IndexSet<NodeId>,
}

impl Node {
    /// Create a new node with the given kind.
    pub fn new(kind: NodeKind) -> Self {
        Self::with_id(NodeId::new(), kind)
    }

    /// Create a node with a caller-chosen ID.
    pub fn with_id(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            version: 0,
            // Derived nodes start dirty so the first read evaluates them
            dirty: !matches!(kind, NodeKind::Signal),
            disposed: false,
            dependencies: IndexSet::new(),
            subscribers: IndexSet::new(),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Get the node's version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Advance the version to `version`.
    ///
    /// Versions never go backwards; older values are ignored.
    pub fn bump_version(&mut self, version: u64) {
        self.version = self.version.max(version);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Mark the node disposed and return the edges it held.
    ///
    /// The caller is responsible for removing the mirrored halves of the
    /// returned edges from the neighboring nodes.
    pub fn dispose(&mut self) -> (IndexSet<NodeId>, IndexSet<NodeId>) {
        self.disposed = true;
        self.dirty = false;
        (
            std::mem::take(&mut self.dependencies),
            std::mem::take(&mut self.subscribers),
        )
    }

    /// Add a dependency (a node that this node reads from).
    pub fn add_dependency(&mut self, node_id: NodeId) -> bool {
        self.dependencies.insert(node_id)
    }

    /// Remove a dependency.
    pub fn remove_dependency(&mut self, node_id: NodeId) -> bool {
        self.dependencies.shift_remove(&node_id)
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &IndexSet<NodeId> {
        &self.dependencies
    }

    /// Add a subscriber (a node that reads from this node).
    pub fn add_subscriber(&mut self, node_id: NodeId) -> bool {
        self.subscribers.insert(node_id)
    }

    /// Remove a subscriber.
    pub fn remove_subscriber(&mut self, node_id: NodeId) -> bool {
        self.subscribers.shift_remove(&node_id)
    }

    /// Get all subscribers.
    pub fn subscribers(&self) -> &IndexSet<NodeId> {
        &self.subscribers
    }
}
