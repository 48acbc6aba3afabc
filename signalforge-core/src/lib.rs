//! SignalForge Core
//!
//! This crate provides a fine-grained reactive runtime: state is declared as
//! signals, derived as computeds and reacted to with effects, and downstream
//! consumers update automatically and exactly once per relevant change.
//!
//! It implements:
//!
//! - Reactive primitives (signals, computeds, effects)
//! - Automatic dependency tracking with re-derived dependency sets
//! - Batched, topologically ordered propagation
//! - Node lifecycle (creation and disposal)
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Reactive primitives, the dependency tracker and the runtime
//! - `graph`: Dependency graph, staleness checks and flush planning
//! - `config`: Runtime configuration
//! - `error`: The error type shared by every fallible operation
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use signalforge_core::{batch, create_computed, create_effect, create_signal};
//!
//! let first = create_signal("Ada".to_string());
//! let last = create_signal("Lovelace".to_string());
//!
//! let full = create_computed({
//!     let (first, last) = (first.clone(), last.clone());
//!     move || format!("{} {}", first.get(), last.get())
//! });
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let _effect = create_effect({
//!     let (full, log) = (full.clone(), Rc::clone(&log));
//!     move || log.borrow_mut().push(full.get())
//! });
//!
//! // Both writes reach the effect as a single update
//! batch(|| {
//!     first.set("Grace".to_string());
//!     last.set("Hopper".to_string());
//! });
//!
//! assert_eq!(*log.borrow(), vec!["Ada Lovelace", "Grace Hopper"]);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{EffectPanicPolicy, RuntimeConfig};
pub use error::{ReactiveError, Result};
pub use graph::{NodeId, NodeKind, SchedulerState};
pub use reactive::{
    batch, create_computed, create_effect, create_signal, create_signal_with_equals, flush_sync, untrack,
    Computed, Effect, EffectCleanup, Runtime, RuntimeGuard, Signal, Subscription,
};
