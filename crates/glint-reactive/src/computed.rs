#![forbid(unsafe_code)]

//! Lazy, memoized derived values.
//!
//! A [`Computed`] pairs a getter with a dirty flag and a cache. Instead of
//! eagerly recomputing when a dependency changes, its scheduler only marks
//! the cache stale and notifies *downstream* readers through a private
//! synthetic tracking slot — the derived value is not a field of any
//! observed record, so it needs its own slot for readers to depend on.
//!
//! # Invariants
//!
//! 1. `cached` is valid to read without recomputation exactly when the
//!    dirty flag is clear.
//! 2. Repeated reads between invalidations cost O(1): the getter runs at
//!    most once per dependency change cycle.
//! 3. Every read tracks the synthetic slot, dirty or not, so whichever
//!    subscriber is reading becomes dependent on future invalidations.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::deps::FieldKey;
use crate::effect::{Effect, EffectOptions, Scheduler};
use crate::runtime::{RecordId, Runtime, RuntimeInner};
use crate::value::Value;

struct ComputedInner {
    effect: Effect,
    dirty: Rc<Cell<bool>>,
    cached: RefCell<Value>,
    /// Synthetic record standing in for "this computed's value".
    slot: RecordId,
    runtime: Weak<RuntimeInner>,
}

/// A lazily evaluated, memoized subscriber exposing a single derived value.
///
/// Cloning shares the same node (same cache, same dirty flag).
#[derive(Clone)]
pub struct Computed {
    inner: Rc<ComputedInner>,
}

impl Computed {
    const VALUE_KEY: &'static str = "value";

    pub(crate) fn new(runtime: &Runtime, getter: impl FnMut() -> Value + 'static) -> Self {
        let slot = runtime.next_record_id();
        let dirty = Rc::new(Cell::new(true));

        // The scheduler deliberately ignores the job it is handed: it never
        // re-runs the getter, it only invalidates and lets the next read
        // recompute. It holds the runtime weakly so a computed outliving its
        // universe cannot keep the store alive through its own effect.
        let scheduler: Scheduler = {
            let dirty = Rc::clone(&dirty);
            let runtime = Rc::downgrade(&runtime.inner);
            Rc::new(move |_job: Effect| {
                dirty.set(true);
                if let Some(inner) = runtime.upgrade() {
                    Runtime::from_inner(inner).trigger(
                        slot,
                        &FieldKey::field(Self::VALUE_KEY),
                        false,
                    );
                }
            })
        };

        let effect = runtime.effect(
            getter,
            EffectOptions::new().lazy().with_scheduler(scheduler),
        );
        Self {
            inner: Rc::new(ComputedInner {
                effect,
                dirty,
                cached: RefCell::new(Value::Null),
                slot,
                runtime: Rc::downgrade(&runtime.inner),
            }),
        }
    }

    /// Read the derived value, recomputing only if a dependency changed
    /// since the last read.
    #[must_use]
    pub fn value(&self) -> Value {
        if self.inner.dirty.get() {
            let fresh = self.inner.effect.run();
            *self.inner.cached.borrow_mut() = fresh;
            self.inner.dirty.set(false);
        }
        // Track unconditionally: the reading subscriber depends on future
        // invalidations even when the cache was already warm.
        if let Some(rt) = self.inner.runtime.upgrade() {
            Runtime::from_inner(rt).track(self.inner.slot, &FieldKey::field(Self::VALUE_KEY));
        }
        self.inner.cached.borrow().clone()
    }

    /// Whether the cache is stale.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    /// Force the next read to recompute, notifying downstream readers.
    pub fn invalidate(&self) {
        self.inner.dirty.set(true);
        if let Some(rt) = self.inner.runtime.upgrade() {
            Runtime::from_inner(rt).trigger(
                self.inner.slot,
                &FieldKey::field(Self::VALUE_KEY),
                false,
            );
        }
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("cached", &self.inner.cached.borrow())
            .field("dirty", &self.inner.dirty.get())
            .field("slot", &self.inner.slot)
            .finish()
    }
}
