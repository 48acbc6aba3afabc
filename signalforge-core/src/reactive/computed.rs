//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. Creating a computed runs nothing. It has no dependencies until the
//!    first read.
//!
//! 2. A read of a stale computed runs the derive function as a tracked
//!    evaluation; the reads it performs become its dependencies, replacing
//!    the previous set.
//!
//! 3. A read of an up-to-date computed returns the cached value.
//!
//! 4. A flush marks dependent computeds dirty; nothing is recomputed until
//!    someone reads them again.
//!
//! # Staleness
//!
//! A computed is stale when it is dirty, or when one of its dependencies
//! carries a newer version than the computed itself. The second check makes
//! writes visible to reads inside a batch, before the flush has marked
//! anything dirty.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

use super::context::RunError;
use super::effect::Effect;
use super::runtime::Runtime;
use super::subscriber::Subscription;
use crate::error::{ReactiveError, Result};
use crate::graph::{NodeId, NodeKind};

struct ComputedInner<T> {
    id: NodeId,
    derive: Box<dyn Fn() -> T>,
    /// Cached value (None if never computed).
    value: RefCell<Option<T>>,
    runtime: Runtime,
}

/// A read-only, lazily computed and cached value.
///
/// # Example
///
/// ```rust
/// use signalforge_core::reactive::{Computed, Signal};
///
/// let count = Signal::new(2);
/// let doubled = Computed::new({
///     let count = count.clone();
///     move || count.get() * 2
/// });
///
/// assert_eq!(doubled.get(), 4);
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: Clone + 'static,
{
    /// Create a new computed on the current runtime.
    ///
    /// The derive function is not run until the first read.
    pub fn new(derive: impl Fn() -> T + 'static) -> Self {
        Runtime::current().create_computed(derive)
    }

    pub(crate) fn new_in(runtime: &Runtime, derive: impl Fn() -> T + 'static) -> Self {
        Self {
            inner: Rc::new(ComputedInner {
                id: runtime.create_node(NodeKind::Computed),
                derive: Box::new(derive),
                value: RefCell::new(None),
                runtime: runtime.clone(),
            }),
        }
    }

    /// Get the computed's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The runtime this computed belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Get the current value, recomputing if necessary and recording the
    /// read if called inside another computed or an effect.
    ///
    /// # Panics
    ///
    /// Panics with the [`ReactiveError`] if the computed was disposed or is
    /// part of a dependency cycle, and resumes any panic of the derive
    /// function.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| err.raise())
    }

    /// Get the current value, reporting engine errors.
    ///
    /// Errors raised by nested reads inside the derive function (a cycle
    /// further down, a disposed signal) are reported here as well.
    pub fn try_get(&self) -> Result<T> {
        let id = self.inner.id;
        let runtime = &self.inner.runtime;

        runtime.ensure_live(id)?;
        if runtime.tracker().is_evaluating(id) {
            return Err(ReactiveError::CyclicDependency { node: id });
        }

        runtime.track_read(id);
        self.refresh()
    }

    /// Get the current value without recording a read.
    ///
    /// # Panics
    ///
    /// Same as [`get`](Self::get).
    pub fn peek(&self) -> T {
        self.try_peek().unwrap_or_else(|err| err.raise())
    }

    /// Get the current value without recording a read.
    pub fn try_peek(&self) -> Result<T> {
        self.inner.runtime.untrack(|| self.try_get())
    }

    /// Computeds are read-only; this always fails.
    pub fn try_set(&self, _value: T) -> Result<()> {
        Err(ReactiveError::ReadOnlyViolation { node: self.inner.id })
    }

    /// Computeds are read-only.
    ///
    /// # Panics
    ///
    /// Always panics with [`ReactiveError::ReadOnlyViolation`].
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            err.raise();
        }
    }

    /// Whether the next read has to run the derive function.
    pub fn is_dirty(&self) -> bool {
        self.inner.runtime.is_stale(self.inner.id)
    }

    /// Whether the derive function has run at least once.
    pub fn has_value(&self) -> bool {
        self.inner.value.borrow().is_some()
    }

    /// The computed's version, bumped on every evaluation.
    pub fn version(&self) -> u64 {
        self.inner
            .runtime
            .graph()
            .borrow()
            .get_node(self.inner.id)
            .map_or(0, |node| node.version())
    }

    /// Number of nodes depending on this computed.
    pub fn subscriber_count(&self) -> usize {
        self.inner.runtime.subscribers_of(self.inner.id).len()
    }

    /// Nodes this computed read during its last evaluation.
    pub fn dependencies(&self) -> Vec<NodeId> {
        self.inner.runtime.dependencies_of(self.inner.id)
    }

    /// Permanently remove the computed from the graph and drop its cache.
    pub fn dispose(&self) {
        self.inner.runtime.dispose_node(self.inner.id);
        let cached = self.inner.value.borrow_mut().take();
        drop(cached);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.runtime.ensure_live(self.inner.id).is_err()
    }

    /// Return the cached value, re-evaluating first if it is stale.
    fn refresh(&self) -> Result<T> {
        let id = self.inner.id;
        let runtime = &self.inner.runtime;

        if !runtime.is_stale(id) {
            if let Some(value) = self.inner.value.borrow().as_ref() {
                return Ok(value.clone());
            }
        }

        tracing::trace!(node = %id, "recomputing");
        let value = runtime
            .tracker()
            .run_tracked(runtime.graph(), id, || (self.inner.derive)())
            .map_err(RunError::into_reactive)?;

        {
            let mut graph = runtime.graph().borrow_mut();
            if let Some(node) = graph.get_node_mut(id) {
                node.mark_clean();
            }
            graph.record_change(id);
        }

        let previous = self.inner.value.replace(Some(value.clone()));
        drop(previous);
        Ok(value)
    }
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Register an external listener called with every new value.
    ///
    /// The listener is driven by an internal effect that keeps the computed
    /// evaluated. It is not called for the value current at subscription,
    /// nor when a re-evaluation produces an equal value.
    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> Subscription {
        self.try_subscribe(listener).unwrap_or_else(|err| err.raise())
    }

    /// Register an external listener, reporting errors.
    pub fn try_subscribe(&self, listener: impl Fn(&T) + 'static) -> Result<Subscription> {
        self.inner.runtime.ensure_live(self.inner.id)?;

        let this = self.clone();
        let mut last: Option<T> = None;
        let effect = Effect::new_in(&self.inner.runtime, move || {
            // Stop quietly once the computed is gone
            let Ok(value) = this.try_get() else {
                return;
            };
            if last.as_ref().is_some_and(|last| *last != value) {
                listener(&value);
            }
            last = Some(value);
        });

        Ok(Subscription::new(move || effect.dispose()))
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        self.runtime.release(self.id);
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
