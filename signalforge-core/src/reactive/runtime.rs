//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, computeds
//! and effects. It owns the dependency graph, the tracker and the scheduler,
//! and it drives flushes.
//!
//! # How It Works
//!
//! 1. Creating a signal, computed or effect allocates a node in the graph.
//!
//! 2. Reads inside a tracked evaluation are recorded by the tracker and
//!    become edges when the evaluation ends.
//!
//! 3. When a signal's value changes, the runtime:
//!    a. Bumps the signal's version
//!    b. Queues it in the scheduler
//!    c. Flushes right away, or when the outermost batch closes
//!
//! 4. A flush visits everything downstream in height order: signals notify
//!    their listeners, computeds are marked dirty (they recompute on the next
//!    read), effects re-run.
//!
//! # Threading
//!
//! Everything is single-threaded. Each thread has a *current* runtime,
//! created lazily, which the free functions (`create_signal`, `batch`, ...)
//! use. Independent runtimes can be built with [`Runtime::new`] and made
//! current for a scope with [`Runtime::enter`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic;
use std::rc::{Rc, Weak};

use super::computed::Computed;
use super::context::{RunError, Tracker};
use super::effect::{Effect, EffectCleanup};
use super::signal::Signal;
use crate::config::{EffectPanicPolicy, RuntimeConfig};
use crate::error::{ReactiveError, Result};
use crate::graph::{plan_flush, Graph, NodeId, NodeKind, Scheduler, SchedulerState};

/// A node the runtime can call back into during a flush.
pub(crate) trait Reactive {
    /// Get the graph node ID of this reactive value.
    fn node_id(&self) -> NodeId;

    /// Called when a flush visits the node.
    fn on_flush(&self) -> std::result::Result<(), RunError>;
}

/// How the runtime holds on to a registered node.
enum Handle {
    /// Owned by user handles; the runtime must not keep it alive.
    Weak(Weak<dyn Reactive>),

    /// Owned by the runtime until disposed (effects).
    Owned(Rc<dyn Reactive>),
}

impl Handle {
    fn upgrade(&self) -> Option<Rc<dyn Reactive>> {
        match self {
            Self::Weak(weak) => weak.upgrade(),
            Self::Owned(rc) => Some(Rc::clone(rc)),
        }
    }
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    graph: RefCell<Graph>,
    tracker: Tracker,
    scheduler: RefCell<Scheduler>,
    handles: RefCell<HashMap<NodeId, Handle>>,
}

/// Handle to a reactive runtime.
///
/// Cloning is cheap and yields a handle to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

thread_local! {
    static CURRENT: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

/// Restores the previously current runtime when dropped.
#[must_use = "the runtime stops being current as soon as the guard is dropped"]
pub struct RuntimeGuard {
    previous: Option<Runtime>,
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let replaced = CURRENT.with(|current| current.replace(previous));
        drop(replaced);
    }
}

/// Leaves a batch if the batched closure unwinds.
struct BatchGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        // Pending writes stay queued and go out with the next flush
        self.runtime.inner.scheduler.borrow_mut().end_batch();
        tracing::debug!("batch unwound, pending writes left queued");
    }
}

/// Returns the scheduler to idle however the flush ends.
struct FlushGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.runtime.inner.scheduler.borrow_mut().finish_flush();
    }
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                graph: RefCell::new(Graph::new()),
                tracker: Tracker::new(),
                scheduler: RefCell::new(Scheduler::new()),
                handles: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// The runtime of the current thread, created on first use.
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow_mut().get_or_insert_with(Self::new).clone())
    }

    /// Make this runtime the current one until the guard is dropped.
    pub fn enter(&self) -> RuntimeGuard {
        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        RuntimeGuard { previous }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Whether two handles point to the same runtime.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_weak(weak: &Weak<RuntimeInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn graph(&self) -> &RefCell<Graph> {
        &self.inner.graph
    }

    /// The dependency tracker of this runtime.
    pub fn tracker(&self) -> &Tracker {
        &self.inner.tracker
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a signal compared with `PartialEq`.
    pub fn create_signal<T>(&self, value: T) -> Signal<T>
    where
        T: Clone + PartialEq + 'static,
    {
        Signal::new_in(self, value, |a: &T, b: &T| a == b)
    }

    /// Create a signal with a custom equality function.
    pub fn create_signal_with_equals<T, E>(&self, value: T, equals: E) -> Signal<T>
    where
        T: Clone + 'static,
        E: Fn(&T, &T) -> bool + 'static,
    {
        Signal::new_in(self, value, equals)
    }

    /// Create a lazily evaluated computed.
    pub fn create_computed<T, F>(&self, derive: F) -> Computed<T>
    where
        T: Clone + 'static,
        F: Fn() -> T + 'static,
    {
        Computed::new_in(self, derive)
    }

    /// Create an effect and run it once.
    pub fn create_effect<F, C>(&self, run: F) -> Effect
    where
        F: FnMut() -> C + 'static,
        C: EffectCleanup,
    {
        Effect::new_in(self, run)
    }

    // ------------------------------------------------------------------
    // Node bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn create_node(&self, kind: NodeKind) -> NodeId {
        let id = self.inner.graph.borrow_mut().insert(kind);
        tracing::trace!(node = %id, ?kind, "node created");
        id
    }

    pub(crate) fn register_weak(&self, id: NodeId, handle: Weak<dyn Reactive>) {
        self.inner.handles.borrow_mut().insert(id, Handle::Weak(handle));
    }

    pub(crate) fn register_owned(&self, handle: Rc<dyn Reactive>) {
        let id = handle.node_id();
        self.inner.handles.borrow_mut().insert(id, Handle::Owned(handle));
    }

    /// Fail with `UseAfterDispose` unless the node is live.
    pub(crate) fn ensure_live(&self, id: NodeId) -> Result<()> {
        if self.inner.graph.borrow().is_live(id) {
            Ok(())
        } else {
            Err(ReactiveError::UseAfterDispose { node: id })
        }
    }

    /// Record a read of `id` by the running computation, if any.
    pub(crate) fn track_read(&self, id: NodeId) {
        self.inner.tracker.read(id);
    }

    /// Record an accepted value change and schedule its subscribers.
    pub(crate) fn notify_changed(&self, id: NodeId) -> Result<()> {
        let version = self.inner.graph.borrow_mut().record_change(id);
        tracing::trace!(node = %id, ?version, "value changed");
        self.try_batch(|| self.inner.scheduler.borrow_mut().enqueue(id))
    }

    /// Permanently remove a node from the graph, keeping a tombstone.
    pub(crate) fn dispose_node(&self, id: NodeId) -> bool {
        let disposed = self.inner.graph.borrow_mut().dispose(id);
        self.inner.scheduler.borrow_mut().forget(id);
        // Drop the handle outside the borrow; it may own closures holding
        // other nodes of this runtime.
        let handle = self.inner.handles.borrow_mut().remove(&id);
        drop(handle);
        if disposed {
            tracing::debug!(node = %id, "node disposed");
        }
        disposed
    }

    /// Forget a node whose last handle was dropped.
    pub(crate) fn release(&self, id: NodeId) {
        let Ok(mut graph) = self.inner.graph.try_borrow_mut() else {
            tracing::warn!(node = %id, "node dropped while the graph was busy, edges left behind");
            return;
        };
        graph.remove(id);
        drop(graph);

        self.inner.scheduler.borrow_mut().forget(id);
        let handle = self.inner.handles.borrow_mut().remove(&id);
        drop(handle);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of live nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.inner.graph.borrow().node_count()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.inner.scheduler.borrow().state()
    }

    pub fn is_batching(&self) -> bool {
        self.inner.scheduler.borrow().is_batching()
    }

    /// Number of changed nodes waiting for a flush.
    pub fn pending_count(&self) -> usize {
        self.inner.scheduler.borrow().pending_count()
    }

    /// Subscribers of a node, in the order they subscribed.
    pub fn subscribers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .borrow()
            .get_node(id)
            .map(|node| node.subscribers().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Dependencies of a node, in the order they were first read.
    pub fn dependencies_of(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .borrow()
            .get_node(id)
            .map(|node| node.dependencies().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a computed must re-derive before its cache is used.
    ///
    /// Once every change has been flushed the node's own flag and direct
    /// dependencies are enough; while changes are waiting the whole upstream
    /// graph is checked.
    pub(crate) fn is_stale(&self, id: NodeId) -> bool {
        let settled = {
            let scheduler = self.inner.scheduler.borrow();
            scheduler.state() == SchedulerState::Idle && !scheduler.has_pending()
        };
        let graph = self.inner.graph.borrow();
        if settled {
            graph.is_stale_shallow(id)
        } else {
            graph.is_stale(id)
        }
    }

    // ------------------------------------------------------------------
    // Batching & flushing
    // ------------------------------------------------------------------

    /// Run `f` without recording any read.
    pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.tracker.untrack(f)
    }

    /// Run `f` as a batch: subscribers are notified once, after the
    /// outermost batch closes.
    ///
    /// # Panics
    ///
    /// Panics if the flush closing the batch fails. Use
    /// [`try_batch`](Self::try_batch) to get the error instead.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.try_batch(f).unwrap_or_else(|err| err.raise())
    }

    /// Run `f` as a batch and report flush errors.
    pub fn try_batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.inner.scheduler.borrow_mut().begin_batch();
        let guard = BatchGuard { runtime: self };
        let value = f();
        std::mem::forget(guard);

        let should_flush = self.inner.scheduler.borrow_mut().end_batch();
        if should_flush {
            self.flush()?;
        }
        Ok(value)
    }

    /// Flush pending changes now.
    ///
    /// # Panics
    ///
    /// Panics if the flush fails.
    pub fn flush_sync(&self) {
        if let Err(err) = self.try_flush_sync() {
            err.raise();
        }
    }

    /// Flush pending changes now, reporting errors.
    ///
    /// Inside a batch this does nothing: the batch flushes when it closes.
    /// During a flush it also does nothing; the running flush picks up new
    /// writes in its next round.
    pub fn try_flush_sync(&self) -> Result<()> {
        let state = self.scheduler_state();
        match state {
            SchedulerState::Idle => self.flush(),
            SchedulerState::Batching(depth) => {
                tracing::debug!(depth, "flush_sync inside a batch, deferred until it closes");
                Ok(())
            }
            SchedulerState::Flushing => Ok(()),
        }
    }

    fn flush(&self) -> Result<()> {
        if !self.inner.scheduler.borrow().has_pending() {
            return Ok(());
        }
        if !self.inner.scheduler.borrow_mut().start_flush() {
            return Ok(());
        }

        let _span = tracing::debug_span!("flush").entered();
        let guard = FlushGuard { runtime: self };
        let outcome = self.inner.tracker.untrack(|| self.flush_rounds());
        drop(guard);

        match outcome? {
            Some(RunError::Reactive(err)) => Err(err),
            Some(RunError::Panicked(payload)) => panic::resume_unwind(payload),
            None => Ok(()),
        }
    }

    /// Run flush rounds until nothing is pending.
    ///
    /// Returns the first failure of a visited node, if any.
    fn flush_rounds(&self) -> Result<Option<RunError>> {
        let max_rounds = self.inner.config.max_flush_rounds;
        let mut first_failure: Option<RunError> = None;
        let mut rounds = 0;

        loop {
            let changed = self.inner.scheduler.borrow_mut().take_pending();
            if changed.is_empty() {
                break;
            }

            rounds += 1;
            if rounds > max_rounds {
                tracing::warn!(rounds = max_rounds, "flush did not settle, dropping pending work");
                warn_superseded(first_failure.as_ref());
                self.abandon(changed);
                return Err(ReactiveError::RunawayFlush { rounds: max_rounds });
            }

            let plan = plan_flush(&self.inner.graph.borrow(), &changed);
            let order = match plan {
                Ok(order) => order,
                Err(err) => {
                    warn_superseded(first_failure.as_ref());
                    self.abandon(changed);
                    return Err(err);
                }
            };
            tracing::debug!(round = rounds, changed = changed.len(), visits = order.len(), "flush round");

            for (index, &node_id) in order.iter().enumerate() {
                let Err(failure) = self.visit(node_id) else {
                    continue;
                };
                tracing::warn!(node = %node_id, error = ?failure, "node failed during flush");

                match self.inner.config.effect_panic {
                    EffectPanicPolicy::AbortFlush => {
                        self.abandon(order[index + 1..].iter().copied());
                        return Ok(Some(failure));
                    }
                    EffectPanicPolicy::ContinueFlush => {
                        first_failure.get_or_insert(failure);
                    }
                }
            }
        }

        Ok(first_failure)
    }

    /// Drop the pending set together with `unvisited`, leaving everything
    /// they would have reached dirty so later reads re-derive.
    fn abandon(&self, unvisited: impl IntoIterator<Item = NodeId>) {
        let pending = self.inner.scheduler.borrow_mut().take_pending();
        let marked = self
            .inner
            .graph
            .borrow_mut()
            .invalidate(unvisited.into_iter().chain(pending));
        tracing::debug!(marked, "flush work abandoned");
    }

    /// Visit one node of a flush round.
    fn visit(&self, node_id: NodeId) -> std::result::Result<(), RunError> {
        let kind = match self.inner.graph.borrow().get_node(node_id) {
            Some(node) if !node.is_disposed() => node.kind(),
            _ => return Ok(()),
        };

        match kind {
            NodeKind::Computed => {
                // A computed re-derived after the write (inside the batch)
                // is already current
                let mut graph = self.inner.graph.borrow_mut();
                if graph.is_stale(node_id) {
                    graph.mark_dirty(node_id);
                }
                Ok(())
            }
            NodeKind::Signal | NodeKind::Effect => {
                let handle = self.inner.handles.borrow().get(&node_id).and_then(Handle::upgrade);
                match handle {
                    Some(handle) => handle.on_flush(),
                    None => Ok(()),
                }
            }
        }
    }
}

fn warn_superseded(failure: Option<&RunError>) {
    if let Some(failure) = failure {
        tracing::warn!(error = ?failure, "node failure superseded by a flush error");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("node_count", &self.node_count())
            .field("state", &self.scheduler_state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Free functions on the current runtime
// ----------------------------------------------------------------------------

/// Create a signal on the current runtime.
pub fn create_signal<T>(value: T) -> Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    Runtime::current().create_signal(value)
}

/// Create a signal with a custom equality function on the current runtime.
pub fn create_signal_with_equals<T, E>(value: T, equals: E) -> Signal<T>
where
    T: Clone + 'static,
    E: Fn(&T, &T) -> bool + 'static,
{
    Runtime::current().create_signal_with_equals(value, equals)
}

/// Create a computed on the current runtime.
pub fn create_computed<T, F>(derive: F) -> Computed<T>
where
    T: Clone + 'static,
    F: Fn() -> T + 'static,
{
    Runtime::current().create_computed(derive)
}

/// Create an effect on the current runtime.
pub fn create_effect<F, C>(run: F) -> Effect
where
    F: FnMut() -> C + 'static,
    C: EffectCleanup,
{
    Runtime::current().create_effect(run)
}

/// Batch writes on the current runtime.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Runtime::current().batch(f)
}

/// Run `f` without dependency tracking on the current runtime.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    Runtime::current().untrack(f)
}

/// Flush pending changes on the current runtime.
pub fn flush_sync() {
    Runtime::current().flush_sync();
}
