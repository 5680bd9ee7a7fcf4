#![forbid(unsafe_code)]

//! Subscriber registration and the run protocol.
//!
//! An [`Effect`] wraps a zero-argument computation. Each run follows a fixed
//! protocol: drop every edge from the previous run, become the active
//! subscriber, invoke the computation (reads re-track as they happen), then
//! restore the enclosing subscriber — exactly, even across nested runs and
//! panic unwinds.
//!
//! # Invariants
//!
//! 1. Identity is stable: the same subscriber keeps the same [`EffectId`]
//!    across runs, so self-trigger comparison and set membership hold.
//! 2. Cleanup precedes the computation, never follows it — a run that reads
//!    fewer fields than the last one must not keep the stale edges.
//! 3. The active-subscriber stack is restored on every exit path.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::deps::{DepSet, WeakDepSet};
use crate::runtime::{ActiveScope, RuntimeInner};
use crate::value::Value;

/// Stable identity of a subscriber within its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectId(pub u64);

impl EffectId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Dispatch function for trigger-driven re-runs.
///
/// When a subscriber carries a scheduler, the trigger dispatcher hands the
/// subscriber handle to it instead of running inline; the scheduler decides
/// when (or whether) to call [`Effect::run`].
pub type Scheduler = Rc<dyn Fn(Effect)>;

/// Configuration for [`crate::runtime::Runtime::effect`].
#[derive(Default, Clone)]
pub struct EffectOptions {
    pub(crate) scheduler: Option<Scheduler>,
    pub(crate) lazy: bool,
}

impl EffectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route all trigger-driven re-runs through `scheduler`.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Suppress the initial run; the caller invokes the handle manually.
    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }
}

impl fmt::Debug for EffectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectOptions")
            .field("scheduler", &self.scheduler.is_some())
            .field("lazy", &self.lazy)
            .finish()
    }
}

/// Shared interior of a subscriber.
pub(crate) struct EffectInner {
    id: EffectId,
    /// Weak so a dropped runtime tears the universe down without cycles.
    runtime: Weak<RuntimeInner>,
    computation: RefCell<Box<dyn FnMut() -> Value>>,
    /// Reverse-edge list: every dep set this subscriber is currently in.
    /// Weak, so the only strong subscriber references are the sets' own and
    /// dropping the store (with the runtime) frees the subscriber.
    deps: RefCell<Vec<WeakDepSet>>,
    scheduler: Option<Scheduler>,
    last: RefCell<Value>,
}

impl EffectInner {
    pub(crate) fn id(&self) -> EffectId {
        self.id
    }

    pub(crate) fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    pub(crate) fn push_dep(&self, set: &DepSet) {
        self.deps.borrow_mut().push(Rc::downgrade(set));
    }

    /// Remove this subscriber from every set in its reverse-edge list, then
    /// empty the list. Idempotent per set: duplicates in the list are fine,
    /// and a set the store has dropped in the meantime is skipped.
    fn cleanup(&self) {
        let deps = std::mem::take(&mut *self.deps.borrow_mut());
        for set in deps {
            if let Some(set) = set.upgrade() {
                set.borrow_mut().shift_remove(&self.id);
            }
        }
    }
}

/// Public runnable handle for a subscriber.
///
/// Cloning shares the same subscriber identity; two runs of the same handle
/// are two runs of the same subscriber.
#[derive(Clone)]
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Effect {
    pub(crate) fn new(
        id: EffectId,
        runtime: &Rc<RuntimeInner>,
        computation: Box<dyn FnMut() -> Value>,
        scheduler: Option<Scheduler>,
    ) -> Self {
        Self {
            inner: Rc::new(EffectInner {
                id,
                runtime: Rc::downgrade(runtime),
                computation: RefCell::new(computation),
                deps: RefCell::new(Vec::new()),
                scheduler,
                last: RefCell::new(Value::Null),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<EffectInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<EffectInner> {
        &self.inner
    }

    #[must_use]
    pub fn id(&self) -> EffectId {
        self.inner.id
    }

    /// The value returned by the most recent run.
    #[must_use]
    pub fn last_value(&self) -> Value {
        self.inner.last.borrow().clone()
    }

    /// Run the wrapped computation under the full protocol and return its
    /// value.
    ///
    /// Old edges are dropped first, then the subscriber becomes the active
    /// reader for the duration of the computation. A panic inside the
    /// computation propagates to the caller; the active-subscriber stack is
    /// still restored.
    pub fn run(&self) -> Value {
        self.inner.cleanup();
        trace!(effect = self.inner.id.raw(), "effect run");

        let value = match self.inner.runtime.upgrade() {
            Some(rt) => {
                let _scope = ActiveScope::enter(&rt, Rc::clone(&self.inner));
                (self.inner.computation.borrow_mut())()
            }
            // Runtime torn down: nothing left to track against, but the
            // computation itself still has a defined result.
            None => (self.inner.computation.borrow_mut())(),
        };

        *self.inner.last.borrow_mut() = value.clone();
        value
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("scheduled", &self.inner.scheduler.is_some())
            .field("edges", &self.inner.deps.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::cell::Cell;

    #[test]
    fn runs_once_on_registration() {
        let rt = Runtime::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        rt.effect(
            move || {
                c.set(c.get() + 1);
                Value::Null
            },
            EffectOptions::new(),
        );
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn lazy_suppresses_initial_run() {
        let rt = Runtime::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let handle = rt.effect(
            move || {
                c.set(c.get() + 1);
                Value::Null
            },
            EffectOptions::new().lazy(),
        );
        assert_eq!(count.get(), 0);
        let _ = handle.run();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn run_returns_computation_value() {
        let rt = Runtime::new();
        let handle = rt.effect(|| Value::Int(41), EffectOptions::new().lazy());
        assert_eq!(handle.run(), Value::Int(41));
        assert_eq!(handle.last_value(), Value::Int(41));
    }

    #[test]
    fn nested_runs_restore_enclosing_subscriber() {
        let rt = Runtime::new();
        let outer_view = rt.record();
        outer_view.set("o", 1);
        let inner_view = rt.record();
        inner_view.set("i", 1);

        let outer_runs = Rc::new(Cell::new(0u32));
        let inner_runs = Rc::new(Cell::new(0u32));

        let o = Rc::clone(&outer_runs);
        let i = Rc::clone(&inner_runs);
        let rt2 = rt.clone();
        let iv = inner_view.clone();
        let ov = outer_view.clone();
        rt.effect(
            move || {
                o.set(o.get() + 1);
                // Nested subscriber registered (and run) inside the outer run.
                let i = Rc::clone(&i);
                let iv = iv.clone();
                rt2.effect(
                    move || {
                        i.set(i.get() + 1);
                        iv.get("i").unwrap_or_default()
                    },
                    EffectOptions::new(),
                );
                // This read must land on the *outer* subscriber: after the
                // nested run pops the stack, the outer one is active again.
                ov.get("o").unwrap_or_default()
            },
            EffectOptions::new(),
        );
        assert_eq!(outer_runs.get(), 1);
        assert_eq!(inner_runs.get(), 1);

        // A write to the outer field re-runs the outer subscriber, proving
        // the read after the nested call was attributed correctly.
        outer_view.set("o", 2);
        assert_eq!(outer_runs.get(), 2);
    }

    #[test]
    fn teardown_releases_subscriber_closures() {
        struct Sentinel(Rc<Cell<bool>>);
        impl Drop for Sentinel {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        {
            let rt = Runtime::new();
            let view = rt.record_from([("k", 1)]);
            let sentinel = Sentinel(Rc::clone(&dropped));
            let v = view.clone();
            let handle = rt.effect(
                move || {
                    let _keep = &sentinel;
                    v.get("k").unwrap_or_default()
                },
                EffectOptions::new(),
            );
            // With live edges, the store's sets own the subscriber; the
            // handle alone going away must not free it...
            drop(handle);
            assert!(!dropped.get());
            drop(view);
        }
        // ...but the runtime going away must: the closure, and the record it
        // captured, are released with the store.
        assert!(
            dropped.get(),
            "subscriber closure freed once its runtime is gone"
        );
    }

    #[test]
    fn stack_restored_after_panic() {
        let rt = Runtime::new();
        let view = rt.record();
        view.set("x", 1);

        let boom = rt.effect(|| panic!("computation failed"), EffectOptions::new().lazy());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| boom.run()));
        assert!(result.is_err());

        // The stack unwound cleanly: reads outside any subscriber register
        // nothing, so this write must not re-run anything (nor panic again).
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let v = view.clone();
        rt.effect(
            move || {
                c.set(c.get() + 1);
                v.get("x").unwrap_or_default()
            },
            EffectOptions::new(),
        );
        view.set("x", 2);
        assert_eq!(count.get(), 2);
    }
}
