//! Errors
//!
//! Every error the engine raises is a programmer error: writing to a derived
//! value, building a dependency cycle, or touching a node after disposal.
//! None of them are transient, so nothing is retried internally.
//!
//! The `try_*` methods on signals, computeds and the runtime return these
//! errors as values. The plain methods (`get`, `set`, ...) panic with the
//! error as the panic payload, the same way `RefCell::borrow` relates to
//! `RefCell::try_borrow`.

use crate::graph::NodeId;

/// Errors raised by the reactive engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReactiveError {
    /// A computed was assigned to.
    #[error("computed {node} is read-only and cannot be set")]
    ReadOnlyViolation { node: NodeId },

    /// A computed (directly or transitively) read itself while evaluating.
    #[error("cyclic dependency detected at node {node}")]
    CyclicDependency { node: NodeId },

    /// A node was used after it was disposed.
    #[error("node {node} was used after being disposed")]
    UseAfterDispose { node: NodeId },

    /// Effects kept writing to their own inputs and the flush never settled.
    #[error("flush did not settle after {rounds} rounds")]
    RunawayFlush { rounds: usize },
}

impl ReactiveError {
    /// Raise this error as a panic.
    ///
    /// The error itself is the payload, so tracked evaluations further up the
    /// stack can recover it and hand it back to a `try_*` caller.
    pub fn raise(self) -> ! {
        std::panic::panic_any(self)
    }
}

/// Result type used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;
