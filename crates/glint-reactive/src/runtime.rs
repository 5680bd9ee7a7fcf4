#![forbid(unsafe_code)]

//! The reactive universe: dependency store, active-subscriber stack, and
//! trigger dispatch.
//!
//! A [`Runtime`] is an explicitly constructed, explicitly owned context —
//! never a module-level singleton — so multiple independent universes can
//! coexist and be torn down deterministically. Everything inside is
//! single-threaded cooperative; interior mutability only, no locking.
//!
//! # Invariants
//!
//! 1. The top of the active stack is the implicit current reader during any
//!    field read; it is restored exactly when a run completes, including
//!    across nested runs and panic unwinds (see [`ActiveScope`]).
//! 2. Trigger dispatch iterates a snapshot, never a live subscriber set.
//! 3. A subscriber is never re-entered synchronously by its own writes
//!    (self-trigger guard).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::trace;

use crate::computed::Computed;
use crate::deps::{DepStore, FieldKey};
use crate::effect::{Effect, EffectId, EffectInner, EffectOptions};
use crate::record::{ReactiveCell, Record};
use crate::value::Value;
use crate::watch::{self, WatchOptions, WatchSource};

/// Stable identity of an observed record within its runtime.
///
/// The dependency store is keyed by this id and holds no strong reference
/// to the record's data, so observing a record never keeps it alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(pub u64);

impl RecordId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

pub(crate) struct RuntimeInner {
    store: DepStore,
    /// Ordered sequence of subscribers currently executing; supports nesting.
    stack: RefCell<Vec<Rc<EffectInner>>>,
    next_record: Cell<u64>,
    next_effect: Cell<u64>,
}

/// Handle to one reactive universe. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                store: DepStore::new(),
                stack: RefCell::new(Vec::new()),
                next_record: Cell::new(1),
                next_effect: Cell::new(1),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<RuntimeInner>) -> Self {
        Self { inner }
    }

    // ── Construction of observed state ───────────────────────────────

    /// Create an empty observed record.
    #[must_use]
    pub fn record(&self) -> Record {
        Record::new(self, self.next_record_id())
    }

    /// Create an observed record seeded with `entries`.
    ///
    /// Seeding is not a write: no subscriber can depend on a record that did
    /// not exist yet, so nothing is triggered.
    #[must_use]
    pub fn record_from<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> Record
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let record = self.record();
        for (key, value) in entries {
            record.seed(key.into(), value.into());
        }
        record
    }

    /// Create a single-value reactive cell (a one-field record).
    #[must_use]
    pub fn cell(&self, initial: impl Into<Value>) -> ReactiveCell {
        ReactiveCell::new(self.record(), initial.into())
    }

    // ── Subscribers ──────────────────────────────────────────────────

    /// Register a subscriber over `computation`.
    ///
    /// Unless [`EffectOptions::lazy`] is set, the subscriber runs once
    /// immediately to establish its initial dependencies.
    pub fn effect(
        &self,
        computation: impl FnMut() -> Value + 'static,
        options: EffectOptions,
    ) -> Effect {
        let effect = Effect::new(
            self.next_effect_id(),
            &self.inner,
            Box::new(computation),
            options.scheduler,
        );
        if !options.lazy {
            let _ = effect.run();
        }
        effect
    }

    /// Create a lazily evaluated, memoized derived value over `getter`.
    pub fn computed(&self, getter: impl FnMut() -> Value + 'static) -> Computed {
        Computed::new(self, getter)
    }

    /// Observe `source` and invoke `callback(old, new)` on every change.
    ///
    /// See [`crate::watch`] for source and option semantics. The returned
    /// handle re-reads the source when run manually; dependency edges keep
    /// the watcher alive regardless.
    pub fn watch(
        &self,
        source: impl Into<WatchSource>,
        callback: impl FnMut(Value, Value) + 'static,
        options: WatchOptions,
    ) -> Effect {
        watch::register(self, source.into(), Box::new(callback), options)
    }

    // ── Track / trigger ──────────────────────────────────────────────

    /// Register the currently active subscriber (if any) as a dependent of
    /// `(record, key)`. A read with no active subscriber is a no-op, not an
    /// error.
    pub(crate) fn track(&self, record: RecordId, key: &FieldKey) {
        let active = self.inner.stack.borrow().last().cloned();
        if let Some(active) = active {
            self.inner.store.track(&active, record, key);
        }
    }

    /// Notify every subscriber dependent on `(record, key)`.
    ///
    /// `key_set_changed` widens the run-set with the `Iterate` subscribers.
    /// Each qualifying subscriber is invoked at most once; the currently
    /// active subscriber is skipped; scheduled subscribers are handed to
    /// their scheduler, the rest run inline in snapshot order.
    pub(crate) fn trigger(&self, record: RecordId, key: &FieldKey, key_set_changed: bool) {
        let run_set = self.inner.store.snapshot(record, key, key_set_changed);
        if run_set.is_empty() {
            return;
        }
        trace!(
            record = record.raw(),
            ?key,
            key_set_changed,
            subscribers = run_set.len(),
            "trigger"
        );
        for sub in run_set {
            // The active subscriber can change between iterations as inline
            // runs nest, so the guard is re-checked per subscriber.
            let is_active = self
                .inner
                .stack
                .borrow()
                .last()
                .is_some_and(|active| active.id() == sub.id());
            if is_active {
                continue;
            }
            let handle = Effect::from_inner(sub);
            match handle.inner().scheduler().cloned() {
                Some(scheduler) => scheduler(handle),
                None => {
                    let _ = handle.run();
                }
            }
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Discard dependency-store bookkeeping that no subscriber uses anymore:
    /// empty per-field sets and record entries with no sets left. Returns
    /// the number of record entries discarded.
    ///
    /// Entries go empty through edge pruning and never through record drops
    /// (the store cannot see those), so hosts with record churn call this at
    /// a quiet point, e.g. after a flush. Tracking re-creates entries on
    /// demand; pruning is never observable through re-run behavior.
    pub fn prune(&self) -> usize {
        self.inner.store.prune()
    }

    // ── Id allocation ────────────────────────────────────────────────

    pub(crate) fn next_record_id(&self) -> RecordId {
        let id = self.inner.next_record.get();
        self.inner.next_record.set(id + 1);
        RecordId::new(id)
    }

    fn next_effect_id(&self) -> EffectId {
        let id = self.inner.next_effect.get();
        self.inner.next_effect.set(id + 1);
        EffectId::new(id)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("active_depth", &self.inner.stack.borrow().len())
            .finish()
    }
}

/// Scoped acquisition of the active-subscriber slot.
///
/// Pushes on entry, pops on drop — so the enclosing subscriber is restored
/// on every exit path, including panics inside the computation.
pub(crate) struct ActiveScope {
    runtime: Rc<RuntimeInner>,
}

impl ActiveScope {
    pub(crate) fn enter(runtime: &Rc<RuntimeInner>, subscriber: Rc<EffectInner>) -> Self {
        runtime.stack.borrow_mut().push(subscriber);
        Self {
            runtime: Rc::clone(runtime),
        }
    }
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        self.runtime.stack.borrow_mut().pop();
    }
}
