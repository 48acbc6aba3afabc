//! Dependency Tracker
//!
//! The tracker knows which computation is currently running. This enables
//! automatic dependency tracking: when a signal is read, the read is recorded
//! against the computation on top of the stack.
//!
//! # Implementation
//!
//! The tracker keeps a stack of frames. Running a computed or an effect
//! pushes a tracked frame; `untrack` pushes a frame that records nothing.
//! Nested evaluations (a computed reading another computed) simply push
//! another frame, so the stack is re-entrant.
//!
//! Reads are collected in the frame and only turned into edges when the
//! evaluation finishes: the collected set replaces the node's previous
//! dependencies (diff-and-replace), so edges that were not re-established are
//! severed instead of lingering.
//!
//! The tracker is owned by a [`Runtime`](super::Runtime) rather than being a
//! global, so every runtime (and every test) gets its own.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use indexmap::IndexSet;

use crate::error::ReactiveError;
use crate::graph::{Graph, NodeId};

/// An entry in the tracker stack.
#[derive(Debug)]
enum Frame {
    /// A computation whose reads are being recorded.
    Tracked {
        node: NodeId,
        reads: IndexSet<NodeId>,
    },

    /// An `untrack` scope: reads are not recorded.
    Untracked,
}

/// Why a tracked run did not produce a value.
pub enum RunError {
    /// The engine refused the run, or a nested read failed.
    Reactive(ReactiveError),

    /// User code panicked. The payload is kept so it can be resumed.
    Panicked(Box<dyn Any + Send>),
}

impl RunError {
    /// Classify a panic payload, recovering engine errors raised by nested
    /// `get()` calls.
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<ReactiveError>() {
            Ok(err) => Self::Reactive(*err),
            Err(payload) => Self::Panicked(payload),
        }
    }

    /// Hand engine errors back as values and resume anything else.
    pub fn into_reactive(self) -> ReactiveError {
        match self {
            Self::Reactive(err) => err,
            Self::Panicked(payload) => panic::resume_unwind(payload),
        }
    }

    /// Re-raise this error as a panic.
    pub fn resume(self) -> ! {
        match self {
            Self::Reactive(err) => err.raise(),
            Self::Panicked(payload) => panic::resume_unwind(payload),
        }
    }
}

impl std::fmt::Debug for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reactive(err) => f.debug_tuple("Reactive").field(err).finish(),
            Self::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

/// The re-entrant stack of running computations.
#[derive(Debug, Default)]
pub struct Tracker {
    stack: RefCell<Vec<Frame>>,
}

/// Pops the frame it pushed, even if the computation unwinds.
struct FrameGuard<'a> {
    tracker: &'a Tracker,
    depth: usize,
}

impl FrameGuard<'_> {
    fn pop(self) -> Option<Frame> {
        let frame = self.tracker.stack.borrow_mut().pop();
        debug_assert_eq!(
            self.tracker.depth(),
            self.depth - 1,
            "tracker frames popped out of order"
        );
        std::mem::forget(self);
        frame
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut stack = self.tracker.stack.borrow_mut();
        stack.truncate(self.depth - 1);
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, frame: Frame) -> FrameGuard<'_> {
        let mut stack = self.stack.borrow_mut();
        stack.push(frame);
        FrameGuard {
            tracker: self,
            depth: stack.len(),
        }
    }

    /// Number of frames on the stack.
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// The node whose reads are currently recorded, if any.
    pub fn current(&self) -> Option<NodeId> {
        match self.stack.borrow().last() {
            Some(Frame::Tracked { node, .. }) => Some(*node),
            _ => None,
        }
    }

    /// Whether a read right now would be recorded.
    pub fn is_tracking(&self) -> bool {
        self.current().is_some()
    }

    /// Whether `node` is somewhere on the stack, mid-evaluation.
    pub fn is_evaluating(&self, node: NodeId) -> bool {
        self.stack
            .borrow()
            .iter()
            .any(|frame| matches!(frame, Frame::Tracked { node: n, .. } if *n == node))
    }

    /// Record a read of `node` by the computation on top of the stack.
    ///
    /// Returns whether the read was recorded.
    pub fn read(&self, node: NodeId) -> bool {
        match self.stack.borrow_mut().last_mut() {
            Some(Frame::Tracked { node: reader, reads }) => {
                tracing::trace!(%reader, source = %node, "tracked read");
                reads.insert(node);
                true
            }
            _ => false,
        }
    }

    /// Run `f` without recording any read.
    pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = self.push(Frame::Untracked);
        let value = f();
        guard.pop();
        value
    }

    /// Run `f` as the evaluation of `node`, then make the reads it performed
    /// the node's dependencies.
    ///
    /// If `f` panics the frame is popped, the node's previous dependencies
    /// are left as they were, and the payload is returned. Fails up front
    /// with `CyclicDependency` if `node` is already being evaluated.
    pub fn run_tracked<R>(&self, graph: &RefCell<Graph>, node: NodeId, f: impl FnOnce() -> R) -> Result<R, RunError> {
        if self.is_evaluating(node) {
            return Err(RunError::Reactive(ReactiveError::CyclicDependency { node }));
        }

        let guard = self.push(Frame::Tracked {
            node,
            reads: IndexSet::new(),
        });
        let outcome = panic::catch_unwind(AssertUnwindSafe(f));
        let frame = guard.pop();

        let value = outcome.map_err(RunError::from_payload)?;
        if let Some(Frame::Tracked { reads, .. }) = frame {
            let diff = graph.borrow_mut().replace_dependencies(node, &reads);
            if !diff.is_empty() {
                tracing::trace!(
                    %node,
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    "dependencies replaced"
                );
            }
        }
        Ok(value)
    }
}
