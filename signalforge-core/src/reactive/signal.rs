//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a tracked evaluation (computed/effect),
//!    the read is recorded and becomes a dependency edge.
//!
//! 2. When a signal is set to a value its equality function considers
//!    different, its version is bumped and it is queued in the scheduler.
//!
//! 3. The flush that follows marks dependent computeds dirty, re-runs
//!    dependent effects and calls the signal's external listeners.
//!
//! Writes inside a batch update the value immediately; only the notification
//! waits for the batch to close.
//!
//! # Memory Layout
//!
//! Each signal handle is a reference-counted pointer to:
//! - The node ID
//! - The value and its equality function
//! - The external listeners
//! - A handle to the owning runtime
//!
//! Dropping the last handle removes the node from the graph.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::context::RunError;
use super::runtime::{Reactive, Runtime};
use super::subscriber::{ListenerId, Subscription};
use crate::config::EffectPanicPolicy;
use crate::error::Result;
use crate::graph::{NodeId, NodeKind};

type Listener<T> = Rc<dyn Fn(&T)>;

struct SignalInner<T> {
    id: NodeId,
    value: RefCell<T>,
    equals: Box<dyn Fn(&T, &T) -> bool>,
    listeners: RefCell<IndexMap<ListenerId, Listener<T>>>,
    runtime: Runtime,
}

/// A reactive signal holding a value of type T.
///
/// # Example
///
/// ```rust
/// use signalforge_core::reactive::Signal;
///
/// let count = Signal::new(0);
/// assert_eq!(count.get(), 0);
///
/// count.set(5);
/// count.update(|n| n + 1);
/// assert_eq!(count.get(), 6);
/// ```
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a new signal on the current runtime.
    pub fn new(value: T) -> Self {
        Runtime::current().create_signal(value)
    }
}

impl<T> Signal<T>
where
    T: Clone + 'static,
{
    /// Create a new signal on the current runtime with a custom equality
    /// function. A function that always returns `false` notifies on every
    /// write.
    pub fn with_equals(value: T, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Runtime::current().create_signal_with_equals(value, equals)
    }

    pub(crate) fn new_in(runtime: &Runtime, value: T, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        let inner = Rc::new(SignalInner {
            id: runtime.create_node(NodeKind::Signal),
            value: RefCell::new(value),
            equals: Box::new(equals),
            listeners: RefCell::new(IndexMap::new()),
            runtime: runtime.clone(),
        });

        let weak = Rc::downgrade(&inner);
        runtime.register_weak(inner.id, weak);
        Self { inner }
    }

    /// Get the signal's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The runtime this signal belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Get the current value, recording the read if called inside a
    /// computed or effect.
    ///
    /// # Panics
    ///
    /// Panics if the signal was disposed.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| err.raise())
    }

    /// Get the current value, or an error if the signal was disposed.
    pub fn try_get(&self) -> Result<T> {
        self.try_with(T::clone)
    }

    /// Borrow the current value, recording the read.
    ///
    /// # Panics
    ///
    /// Panics if the signal was disposed.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.try_with(f).unwrap_or_else(|err| err.raise())
    }

    /// Borrow the current value, recording the read.
    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.inner.runtime.ensure_live(self.inner.id)?;
        self.inner.runtime.track_read(self.inner.id);
        Ok(f(&self.inner.value.borrow()))
    }

    /// Get the current value without recording a read.
    ///
    /// # Panics
    ///
    /// Panics if the signal was disposed.
    pub fn peek(&self) -> T {
        self.try_peek().unwrap_or_else(|err| err.raise())
    }

    /// Get the current value without recording a read.
    pub fn try_peek(&self) -> Result<T> {
        self.inner.runtime.untrack(|| self.try_get())
    }

    /// Set a new value.
    ///
    /// Equal values are ignored. Otherwise subscribers are notified, right
    /// away or when the enclosing batch closes.
    ///
    /// # Panics
    ///
    /// Panics if the signal was disposed or if the flush triggered by the
    /// write fails.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            err.raise();
        }
    }

    /// Set a new value, reporting errors.
    pub fn try_set(&self, value: T) -> Result<()> {
        let id = self.inner.id;
        self.inner.runtime.ensure_live(id)?;

        let unchanged = (self.inner.equals)(&self.inner.value.borrow(), &value);
        if unchanged {
            tracing::trace!(node = %id, "write ignored, value unchanged");
            return Ok(());
        }

        let previous = self.inner.value.replace(value);
        drop(previous);
        self.inner.runtime.notify_changed(id)
    }

    /// Update the value using a function of the current value.
    ///
    /// # Panics
    ///
    /// Panics if the signal was disposed or the triggered flush fails.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        if let Err(err) = self.try_update(f) {
            err.raise();
        }
    }

    /// Update the value using a function of the current value.
    pub fn try_update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        self.inner.runtime.ensure_live(self.inner.id)?;
        let next = f(&self.inner.value.borrow());
        self.try_set(next)
    }

    /// Register an external listener, called with the final value after
    /// every flush in which the signal changed.
    ///
    /// # Panics
    ///
    /// Panics if the signal was disposed.
    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> Subscription {
        self.try_subscribe(listener).unwrap_or_else(|err| err.raise())
    }

    /// Register an external listener, reporting errors.
    pub fn try_subscribe(&self, listener: impl Fn(&T) + 'static) -> Result<Subscription> {
        self.inner.runtime.ensure_live(self.inner.id)?;

        let listener_id = ListenerId::new();
        self.inner
            .listeners
            .borrow_mut()
            .insert(listener_id, Rc::new(listener));

        let weak = Rc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.listeners.borrow_mut().shift_remove(&listener_id);
                drop(removed);
            }
        }))
    }

    /// Number of subscribers: dependent nodes plus external listeners.
    pub fn subscriber_count(&self) -> usize {
        self.inner.runtime.subscribers_of(self.inner.id).len() + self.listener_count()
    }

    /// Number of external listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Whether `node` currently depends on this signal.
    pub fn has_subscriber(&self, node: NodeId) -> bool {
        self.inner.runtime.subscribers_of(self.inner.id).contains(&node)
    }

    /// The signal's version, bumped on every accepted write.
    pub fn version(&self) -> u64 {
        self.inner
            .runtime
            .graph()
            .borrow()
            .get_node(self.inner.id)
            .map_or(0, |node| node.version())
    }

    /// Permanently remove the signal from the graph.
    ///
    /// Dependents lose their edge and will fail with `UseAfterDispose` if
    /// they read the signal again. Listeners are dropped.
    pub fn dispose(&self) {
        self.inner.runtime.dispose_node(self.inner.id);
        let listeners = std::mem::take(&mut *self.inner.listeners.borrow_mut());
        drop(listeners);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.runtime.ensure_live(self.inner.id).is_err()
    }
}

impl<T> Reactive for SignalInner<T>
where
    T: Clone + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn on_flush(&self) -> std::result::Result<(), RunError> {
        let listeners: SmallVec<[Listener<T>; 4]> = self.listeners.borrow().values().cloned().collect();
        if listeners.is_empty() {
            return Ok(());
        }

        let value = self.value.borrow().clone();
        tracing::trace!(node = %self.id, listeners = listeners.len(), "notifying listeners");
        let policy = self.runtime.config().effect_panic;
        let mut first_failure = None;
        for listener in listeners {
            let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&value))) else {
                continue;
            };
            let failure = RunError::from_payload(payload);
            if policy == EffectPanicPolicy::AbortFlush {
                return Err(failure);
            }
            tracing::debug!(node = %self.id, "listener failed, notifying the rest");
            first_failure.get_or_insert(failure);
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        self.runtime.release(self.id);
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .field("listener_count", &self.inner.listeners.borrow().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
