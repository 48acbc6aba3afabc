//! Integration Tests for the Reactive System
//!
//! These tests verify that signals, computeds, effects and the scheduler work
//! together correctly.

use std::any::Any;
use std::cell::{Cell, OnceCell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use signalforge_core::{
    batch, create_computed, create_effect, create_signal, untrack, Computed, EffectPanicPolicy, ReactiveError,
    Runtime, RuntimeConfig, SchedulerState,
};
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test output. Set `RUST_LOG=signalforge_core=trace`
/// to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn payload_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Shared call counter for derive and effect functions.
fn counter() -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
    let count = Rc::new(Cell::new(0));
    (Rc::clone(&count), count)
}

fn bump(count: &Cell<usize>) {
    count.set(count.get() + 1);
}

/// Writing a value equal to the current one changes nothing.
#[test]
fn equal_write_is_a_no_op() {
    init_tracing();
    let runtime = Runtime::new();
    let signal = runtime.create_signal(3);
    let (calls, calls_c) = counter();
    let _sub = signal.subscribe(move |_| bump(&calls_c));

    let version = signal.version();
    signal.set(3);

    assert_eq!(signal.version(), version);
    assert_eq!(calls.get(), 0);
    assert_eq!(runtime.pending_count(), 0);
}

/// A custom equality function decides what counts as a change.
#[test]
fn custom_equality_controls_notifications() {
    init_tracing();
    let runtime = Runtime::new();
    let always = runtime.create_signal_with_equals(vec![1], |_, _| false);
    let by_len = runtime.create_signal_with_equals(vec![1], |a: &Vec<i32>, b: &Vec<i32>| a.len() == b.len());
    let (always_calls, always_c) = counter();
    let (len_calls, len_c) = counter();
    let _a = always.subscribe(move |_| bump(&always_c));
    let _b = by_len.subscribe(move |_| bump(&len_c));

    always.set(vec![1]);
    by_len.set(vec![2]);
    by_len.set(vec![2, 3]);

    assert_eq!(always_calls.get(), 1);
    assert_eq!(len_calls.get(), 1);
    assert_eq!(by_len.get(), vec![2, 3]);
}

#[test]
fn computed_follows_signal() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(1);
    let c = runtime.create_computed({
        let s = s.clone();
        move || s.get() * 2
    });

    assert_eq!(c.get(), 2);
    s.set(5);
    assert_eq!(c.get(), 10);
}

#[test]
fn computed_memoizes_between_changes() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(1);
    let (calls, calls_c) = counter();
    let c = runtime.create_computed({
        let s = s.clone();
        move || {
            bump(&calls_c);
            s.get() + 1
        }
    });

    assert_eq!(c.get(), 2);
    assert_eq!(c.get(), 2);
    assert_eq!(calls.get(), 1);

    s.set(2);
    assert_eq!(c.get(), 3);
    assert_eq!(c.get(), 3);
    assert_eq!(calls.get(), 2);
}

/// The bottom of a diamond re-derives once per change, not once per path.
#[test]
fn diamond_recomputes_once() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(1);
    let b = runtime.create_computed({
        let s = s.clone();
        move || s.get()
    });
    let c = runtime.create_computed({
        let s = s.clone();
        move || s.get()
    });
    let (calls, calls_c) = counter();
    let d = runtime.create_computed({
        let (b, c) = (b.clone(), c.clone());
        move || {
            bump(&calls_c);
            b.get() + c.get()
        }
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    let _effect = runtime.create_effect({
        let (d, seen) = (d.clone(), Rc::clone(&seen));
        move || seen.borrow_mut().push(d.get())
    });
    assert_eq!(calls.get(), 1);

    s.set(5);
    assert_eq!(calls.get(), 2);
    assert_eq!(*seen.borrow(), vec![2, 10]);

    s.set(7);
    assert_eq!(calls.get(), 3);
    assert_eq!(*seen.borrow(), vec![2, 10, 14]);
}

/// Effects never observe a computed lagging behind its source.
#[test]
fn effects_see_consistent_values() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(1);
    let doubled = runtime.create_computed({
        let s = s.clone();
        move || s.get() * 2
    });

    let pairs = Rc::new(RefCell::new(Vec::new()));
    let _effect = runtime.create_effect({
        let (s, doubled, pairs) = (s.clone(), doubled.clone(), Rc::clone(&pairs));
        move || pairs.borrow_mut().push((s.get(), doubled.get()))
    });

    s.set(2);
    s.set(3);
    assert_eq!(*pairs.borrow(), vec![(1, 2), (2, 4), (3, 6)]);
}

#[test]
fn batch_notifies_once_with_final_value() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(0);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _sub = s.subscribe({
        let seen = Rc::clone(&seen);
        move |v| seen.borrow_mut().push(*v)
    });

    runtime.batch(|| {
        s.set(1);
        s.set(2);
        s.set(3);
        assert!(seen.borrow().is_empty());
    });

    assert_eq!(*seen.borrow(), vec![3]);
}

/// A write that is undone inside the batch still flushes, with the restored
/// value.
#[test]
fn batch_flushes_each_changed_signal_once() {
    init_tracing();
    let runtime = Runtime::new();
    let a = runtime.create_signal(0);
    let b = runtime.create_signal(0);
    let (runs, runs_c) = counter();
    let _effect = runtime.create_effect({
        let (a, b) = (a.clone(), b.clone());
        move || {
            bump(&runs_c);
            let _sum = a.get() + b.get();
        }
    });

    runtime.batch(|| {
        a.set(1);
        b.set(1);
        runtime.batch(|| a.set(2));
        assert_eq!(runtime.pending_count(), 2);
    });

    assert_eq!(runs.get(), 2);
    assert_eq!(runtime.scheduler_state(), SchedulerState::Idle);
}

#[test]
fn computed_reads_inside_batch_see_new_values() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(1);
    let c = runtime.create_computed({
        let s = s.clone();
        move || s.get() * 2
    });
    let outer = runtime.create_computed({
        let c = c.clone();
        move || c.get() + 1
    });
    assert_eq!(outer.get(), 3);

    runtime.batch(|| {
        s.set(5);
        assert_eq!(c.get(), 10);
        assert_eq!(outer.get(), 11);
    });
}

/// A computed re-derived inside a batch is not derived again by the flush
/// that closes it.
#[test]
fn batch_read_computed_is_not_rederived_on_flush() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(1);
    let (derives, derives_c) = counter();
    let c = runtime.create_computed({
        let s = s.clone();
        move || {
            bump(&derives_c);
            s.get() * 2
        }
    });
    assert_eq!(c.get(), 2);
    assert_eq!(derives.get(), 1);

    runtime.batch(|| {
        s.set(5);
        assert_eq!(c.get(), 10);
    });
    assert_eq!(derives.get(), 2);
    assert!(!c.is_dirty());

    assert_eq!(c.get(), 10);
    assert_eq!(derives.get(), 2);
}

#[test]
fn untracked_reads_do_not_subscribe() {
    init_tracing();
    let runtime = Runtime::new();
    let tracked = runtime.create_signal(1);
    let dep = runtime.create_signal(10);
    let (calls, calls_c) = counter();
    let c = runtime.create_computed({
        let (tracked, dep, runtime) = (tracked.clone(), dep.clone(), runtime.clone());
        move || {
            bump(&calls_c);
            tracked.get() + runtime.untrack(|| dep.get())
        }
    });

    assert_eq!(c.get(), 11);
    assert!(!dep.has_subscriber(c.id()));

    dep.set(20);
    assert!(!c.is_dirty());
    assert_eq!(c.get(), 11);
    assert_eq!(calls.get(), 1);

    tracked.set(2);
    assert_eq!(c.get(), 22);
}

/// Switching branches drops the edge to the branch no longer read.
#[test]
fn dynamic_dependencies_are_replaced() {
    init_tracing();
    let runtime = Runtime::new();
    let use_left = runtime.create_signal(true);
    let left = runtime.create_signal(1);
    let right = runtime.create_signal(2);
    let (runs, runs_c) = counter();
    let effect = runtime.create_effect({
        let (use_left, left, right) = (use_left.clone(), left.clone(), right.clone());
        move || {
            bump(&runs_c);
            if use_left.get() {
                left.get();
            } else {
                right.get();
            }
        }
    });
    assert_eq!(effect.dependencies(), vec![use_left.id(), left.id()]);

    use_left.set(false);
    assert_eq!(effect.dependencies(), vec![use_left.id(), right.id()]);
    assert_eq!(runs.get(), 2);

    // The old branch no longer triggers the effect
    left.set(10);
    assert_eq!(runs.get(), 2);
    right.set(20);
    assert_eq!(runs.get(), 3);
}

#[test]
fn disposed_effect_stops_running() {
    init_tracing();
    let runtime = Runtime::new();
    let dep = runtime.create_signal(0);
    let (runs, runs_c) = counter();
    let effect = runtime.create_effect({
        let dep = dep.clone();
        move || {
            dep.get();
            bump(&runs_c);
        }
    });
    assert!(dep.has_subscriber(effect.id()));

    effect.dispose();
    assert!(!dep.has_subscriber(effect.id()));

    dep.set(1);
    dep.set(2);
    assert_eq!(runs.get(), 1);
}

#[test]
fn disposed_signal_fails_dependents() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(1);
    let c = runtime.create_computed({
        let s = s.clone();
        move || s.get() + 1
    });
    assert_eq!(c.get(), 2);

    s.dispose();
    assert!(s.is_disposed());
    assert_eq!(s.try_set(3), Err(ReactiveError::UseAfterDispose { node: s.id() }));
    assert_eq!(c.try_get(), Err(ReactiveError::UseAfterDispose { node: s.id() }));
}

#[test]
fn mutual_computeds_are_a_cycle() {
    init_tracing();
    let runtime = Runtime::new();
    let b_slot: Rc<OnceCell<Computed<i32>>> = Rc::new(OnceCell::new());
    let a = runtime.create_computed({
        let b_slot = Rc::clone(&b_slot);
        move || b_slot.get().map_or(0, Computed::get)
    });
    let b = runtime.create_computed({
        let a = a.clone();
        move || a.get()
    });
    let _ = b_slot.set(b.clone());

    assert_eq!(a.try_get(), Err(ReactiveError::CyclicDependency { node: a.id() }));

    // The failed evaluation left no edges behind
    assert!(a.dependencies().is_empty());
    assert!(b.dependencies().is_empty());
    assert_eq!(runtime.tracker().depth(), 0);
}

#[test]
fn cycle_panics_through_get() {
    init_tracing();
    let runtime = Runtime::new();
    let slot: Rc<OnceCell<Computed<i32>>> = Rc::new(OnceCell::new());
    let c = runtime.create_computed({
        let slot = Rc::clone(&slot);
        move || slot.get().map_or(0, Computed::get)
    });
    let _ = slot.set(c.clone());

    let payload = panic::catch_unwind(AssertUnwindSafe(|| c.get())).unwrap_err();
    assert_eq!(
        payload.downcast_ref::<ReactiveError>(),
        Some(&ReactiveError::CyclicDependency { node: c.id() })
    );
}

#[test]
fn computed_rejects_writes() {
    init_tracing();
    let runtime = Runtime::new();
    let c = runtime.create_computed(|| 1);
    assert_eq!(c.try_set(2), Err(ReactiveError::ReadOnlyViolation { node: c.id() }));
}

/// A panicking effect does not stop its siblings under the default policy.
#[test]
fn continue_policy_visits_remaining_nodes() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(0);
    let failing = runtime.create_effect({
        let s = s.clone();
        move || {
            if s.get() == 1 {
                panic!("effect failed");
            }
        }
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _healthy = runtime.create_effect({
        let (s, seen) = (s.clone(), Rc::clone(&seen));
        move || seen.borrow_mut().push(s.get())
    });

    let payload = panic::catch_unwind(AssertUnwindSafe(|| s.set(1))).unwrap_err();
    assert_eq!(payload_message(payload.as_ref()), Some("effect failed"));
    assert_eq!(*seen.borrow(), vec![0, 1]);
    assert_eq!(runtime.scheduler_state(), SchedulerState::Idle);

    // The failed effect kept its edge and recovers on the next change
    assert!(s.has_subscriber(failing.id()));
    s.set(2);
    assert_eq!(failing.run_count(), 2);
    assert_eq!(*seen.borrow(), vec![0, 1, 2]);
}

#[test]
fn abort_policy_stops_the_flush() {
    init_tracing();
    let runtime = Runtime::with_config(RuntimeConfig::new().with_effect_panic(EffectPanicPolicy::AbortFlush));
    let s = runtime.create_signal(0);
    let other = runtime.create_signal(0);
    let _writer = runtime.create_effect({
        let (s, other) = (s.clone(), other.clone());
        move || {
            if s.get() == 1 {
                other.set(1);
            }
        }
    });
    let _failing = runtime.create_effect({
        let s = s.clone();
        move || {
            if s.get() == 1 {
                panic!("effect failed");
            }
        }
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _skipped = runtime.create_effect({
        let (s, seen) = (s.clone(), Rc::clone(&seen));
        move || seen.borrow_mut().push(s.get())
    });
    let c = runtime.create_computed({
        let s = s.clone();
        move || s.get() * 10
    });
    let outer = runtime.create_computed({
        let c = c.clone();
        move || c.get() + 1
    });
    let (other_calls, other_calls_c) = counter();
    let _other_sub = other.subscribe(move |_| bump(&other_calls_c));
    let doubled = runtime.create_computed({
        let other = other.clone();
        move || other.get() * 2
    });
    assert_eq!(outer.get(), 1);
    assert_eq!(doubled.get(), 0);

    let payload = panic::catch_unwind(AssertUnwindSafe(|| s.set(1))).unwrap_err();
    assert_eq!(payload_message(payload.as_ref()), Some("effect failed"));
    assert_eq!(*seen.borrow(), vec![0]);
    assert_eq!(runtime.scheduler_state(), SchedulerState::Idle);

    // The write made earlier in the aborted round is dropped, not left queued
    assert_eq!(other.peek(), 1);
    assert_eq!(runtime.pending_count(), 0);
    assert_eq!(other_calls.get(), 0);

    // Computeds the flush never reached re-derive on their next read
    assert!(outer.is_dirty());
    assert_eq!(c.get(), 10);
    assert_eq!(outer.get(), 11);
    assert_eq!(doubled.get(), 2);

    // A later flush does not replay the dropped notification
    s.set(2);
    assert_eq!(other_calls.get(), 0);
    assert_eq!(*seen.borrow(), vec![0, 2]);
}

#[test]
fn effect_feedback_settles_over_rounds() {
    init_tracing();
    let runtime = Runtime::new();
    let input = runtime.create_signal(0);
    let clamped = runtime.create_signal(0);
    let _clamp = runtime.create_effect({
        let (input, clamped) = (input.clone(), clamped.clone());
        move || clamped.set(input.get().min(10))
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _watch = runtime.create_effect({
        let (clamped, seen) = (clamped.clone(), Rc::clone(&seen));
        move || seen.borrow_mut().push(clamped.get())
    });

    input.set(4);
    input.set(40);
    input.set(50);
    assert_eq!(*seen.borrow(), vec![0, 4, 10]);
}

#[test]
fn self_feeding_effect_is_a_runaway_flush() {
    init_tracing();
    let runtime = Runtime::with_config(RuntimeConfig::new().with_max_flush_rounds(10));
    let s = runtime.create_signal(0);
    let effect = runtime.create_effect({
        let s = s.clone();
        move || {
            let value = s.get();
            if value > 0 {
                s.set(value + 1);
            }
        }
    });

    assert_eq!(s.try_set(1), Err(ReactiveError::RunawayFlush { rounds: 10 }));
    assert_eq!(effect.run_count(), 11);
    assert_eq!(runtime.scheduler_state(), SchedulerState::Idle);
}

#[test]
fn dropping_the_last_handle_removes_the_node() {
    init_tracing();
    let runtime = Runtime::new();
    let keep = runtime.create_signal(0);
    {
        let temporary = runtime.create_signal(1);
        let _copy = temporary.clone();
        assert_eq!(runtime.node_count(), 2);
    }
    assert_eq!(runtime.node_count(), 1);

    {
        let c = runtime.create_computed({
            let keep = keep.clone();
            move || keep.get()
        });
        c.get();
        assert_eq!(keep.subscriber_count(), 1);
    }
    assert_eq!(keep.subscriber_count(), 0);
    assert_eq!(runtime.node_count(), 1);
}

#[test]
fn computed_subscription_skips_equal_values() {
    init_tracing();
    let runtime = Runtime::new();
    let s = runtime.create_signal(1);
    let parity = runtime.create_computed({
        let s = s.clone();
        move || s.get() % 2
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    let subscription = parity.subscribe({
        let seen = Rc::clone(&seen);
        move |v| seen.borrow_mut().push(*v)
    });

    s.set(3);
    s.set(4);
    s.set(6);
    s.set(7);
    assert_eq!(*seen.borrow(), vec![0, 1]);

    subscription.unsubscribe();
    assert!(!subscription.is_active());
    s.set(8);
    assert_eq!(*seen.borrow(), vec![0, 1]);
}

/// The free functions use the thread's current runtime.
#[test]
fn free_functions_use_the_current_runtime() {
    init_tracing();
    let runtime = Runtime::new();
    let _guard = runtime.enter();

    let s = create_signal(2);
    let c = create_computed({
        let s = s.clone();
        move || s.get() * s.get()
    });
    let seen = Rc::new(Cell::new(0));
    let _effect = create_effect({
        let (c, seen) = (c.clone(), Rc::clone(&seen));
        move || seen.set(c.get())
    });

    batch(|| {
        s.set(3);
        assert_eq!(untrack(|| c.get()), 9);
    });
    assert_eq!(seen.get(), 9);
    assert_eq!(runtime.node_count(), 3);
    assert!(s.runtime().ptr_eq(&runtime));
}
