//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies. The first run happens inside a batch, so writes
//!    it makes are flushed once it returns.
//!
//! 2. When any dependency changes, the flush re-runs the effect after every
//!    computed and effect it depends on has been visited.
//!
//! 3. Each run records its reads afresh; dependencies it no longer reads are
//!    dropped.
//!
//! # Differences from Computed
//!
//! - Computeds return a value; effects do not.
//! - Computeds are lazy (compute on access); effects are eager (run when deps change).
//! - Computeds are owned by their handles; effects are owned by the runtime
//!   and live until disposed.
//!
//! # Cleanup
//!
//! Effects can optionally return a cleanup function. It is called before the
//! effect re-runs and when the effect is disposed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use super::context::RunError;
use super::runtime::{Reactive, Runtime, RuntimeInner};
use crate::graph::{NodeId, NodeKind};

type Cleanup = Box<dyn FnOnce()>;

/// What an effect's run function may return.
///
/// Implemented for `()` (no cleanup), for any `FnOnce()` closure (called
/// before the next run and on disposal), and for `Option` of either.
pub trait EffectCleanup {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>>;
}

impl EffectCleanup for () {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>> {
        None
    }
}

impl<F> EffectCleanup for F
where
    F: FnOnce() + 'static,
{
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>> {
        Some(Box::new(self))
    }
}

impl<C> EffectCleanup for Option<C>
where
    C: EffectCleanup,
{
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>> {
        self.and_then(EffectCleanup::into_cleanup)
    }
}

struct EffectInner {
    id: NodeId,
    run: RefCell<Box<dyn FnMut() -> Option<Cleanup>>>,
    cleanup: RefCell<Option<Cleanup>>,
    disposed: Cell<bool>,
    run_count: Cell<usize>,
    runtime: Weak<RuntimeInner>,
}

impl EffectInner {
    /// Run the previous cleanup, then the effect function as a tracked
    /// evaluation.
    fn execute(&self) -> Result<(), RunError> {
        if self.disposed.get() {
            return Ok(());
        }
        let Some(runtime) = Runtime::from_weak(&self.runtime) else {
            return Ok(());
        };

        self.run_cleanup(&runtime)?;

        tracing::trace!(node = %self.id, "running effect");
        let cleanup = runtime.tracker().run_tracked(runtime.graph(), self.id, || {
            let mut run = self.run.borrow_mut();
            (&mut **run)()
        })?;
        self.run_count.set(self.run_count.get() + 1);

        {
            let mut graph = runtime.graph().borrow_mut();
            if let Some(node) = graph.get_node_mut(self.id) {
                node.mark_clean();
            }
            graph.record_change(self.id);
        }

        // Disposed by its own run: nothing will call this cleanup later
        if self.disposed.get() {
            if let Some(cleanup) = cleanup {
                runtime.untrack(cleanup);
            }
            return Ok(());
        }

        let previous = self.cleanup.replace(cleanup);
        drop(previous);
        Ok(())
    }

    fn run_cleanup(&self, runtime: &Runtime) -> Result<(), RunError> {
        let cleanup = self.cleanup.borrow_mut().take();
        match cleanup {
            Some(cleanup) => panic::catch_unwind(AssertUnwindSafe(|| runtime.untrack(cleanup)))
                .map_err(RunError::from_payload),
            None => Ok(()),
        }
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        // Runs once the effect is disposed and its last handle is gone;
        // while live, the runtime holds it.
        if let Some(runtime) = Runtime::from_weak(&self.runtime) {
            runtime.release(self.id);
        }
    }
}

impl Reactive for EffectInner {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn on_flush(&self) -> Result<(), RunError> {
        self.execute()
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// Dropping an `Effect` handle does not stop the effect; call
/// [`dispose`](Self::dispose). Its graph node goes away once it is disposed
/// and every handle is dropped. An effect whose function captures signals or
/// computeds keeps their runtime alive until it is disposed.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use signalforge_core::reactive::{Effect, Signal};
///
/// let count = Signal::new(0);
/// let seen = Rc::new(Cell::new(-1));
///
/// let effect = Effect::new({
///     let (count, seen) = (count.clone(), Rc::clone(&seen));
///     move || seen.set(count.get())
/// });
/// assert_eq!(seen.get(), 0);
///
/// count.set(5);
/// assert_eq!(seen.get(), 5);
///
/// effect.dispose();
/// count.set(6);
/// assert_eq!(seen.get(), 5);
/// ```
#[derive(Clone)]
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Effect {
    /// Create an effect on the current runtime and run it once.
    ///
    /// # Panics
    ///
    /// Resumes the panic of the first run, after disposing the effect.
    pub fn new<F, C>(run: F) -> Self
    where
        F: FnMut() -> C + 'static,
        C: EffectCleanup,
    {
        Runtime::current().create_effect(run)
    }

    pub(crate) fn new_in<F, C>(runtime: &Runtime, mut run: F) -> Self
    where
        F: FnMut() -> C + 'static,
        C: EffectCleanup,
    {
        let inner = Rc::new(EffectInner {
            id: runtime.create_node(NodeKind::Effect),
            run: RefCell::new(Box::new(move || run().into_cleanup())),
            cleanup: RefCell::new(None),
            disposed: Cell::new(false),
            run_count: Cell::new(0),
            runtime: runtime.downgrade(),
        });
        runtime.register_owned(Rc::clone(&inner) as Rc<dyn Reactive>);
        let effect = Self { inner };

        let flushed = runtime.try_batch(|| effect.inner.execute());
        match flushed {
            Ok(Ok(())) => effect,
            Ok(Err(failure)) => {
                tracing::debug!(node = %effect.id(), "first run failed, disposing effect");
                effect.dispose();
                failure.resume()
            }
            Err(err) => err.raise(),
        }
    }

    /// Get the effect's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Stop the effect: run its pending cleanup and remove it from the
    /// graph. Calling this more than once does nothing.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }

        let Some(runtime) = Runtime::from_weak(&self.inner.runtime) else {
            return;
        };
        runtime.dispose_node(self.inner.id);

        let cleanup = self.inner.cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            runtime.untrack(cleanup);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Number of completed runs.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.get()
    }

    /// Nodes the effect read during its last run.
    pub fn dependencies(&self) -> Vec<NodeId> {
        Runtime::from_weak(&self.inner.runtime)
            .map(|runtime| runtime.dependencies_of(self.inner.id))
            .unwrap_or_default()
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies().len()
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
