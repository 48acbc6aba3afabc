//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds, and
//! effects, plus the runtime that drives them.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracked evaluation (a computed or an effect), the read becomes a
//! dependency edge. When the signal's value changes, its dependents are
//! scheduled.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. It re-evaluates only
//! when it is read after one of its dependencies changed.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that re-runs whenever its
//! dependencies change. Effects are used to synchronize reactive state with
//! the outside world.
//!
//! # Implementation Notes
//!
//! Every runtime owns a [`Tracker`] that detects dependencies automatically:
//! a read checks whether a tracked evaluation is running and, if so, records
//! itself against it. Writes go through the runtime's scheduler, which
//! batches them and flushes dependents in topological order.
//!
//! This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is used by SolidJS, Vue 3, and Leptos.

mod computed;
mod context;
mod effect;
mod runtime;
mod signal;
mod subscriber;

pub use computed::Computed;
pub use context::{RunError, Tracker};
pub use effect::{Effect, EffectCleanup};
pub use runtime::{
    batch, create_computed, create_effect, create_signal, create_signal_with_equals, flush_sync, untrack,
    Runtime, RuntimeGuard,
};
pub use signal::Signal;
pub use subscriber::{ListenerId, Subscription};
