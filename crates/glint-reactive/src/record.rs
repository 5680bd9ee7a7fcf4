#![forbid(unsafe_code)]

//! Reactive views over mutable records.
//!
//! A [`Record`] is the interception wrapper the rest of the system observes:
//! every read funnels through `track`, every write through `trigger`. There
//! is no implicit property interception in Rust, so the wrapper exposes an
//! explicit accessor layer (`get`/`set`/`remove`/`keys`/...) with the same
//! tracking semantics as a proxy's traps:
//!
//! - `get`, `contains_key` track the named field;
//! - `keys`, `len` track the synthetic iteration key;
//! - `set` triggers the field, widening to the iteration key when the write
//!   adds a new field; `remove` always widens.
//!
//! Field order is insertion order, so enumeration is deterministic.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::deps::FieldKey;
use crate::runtime::{RecordId, Runtime, RuntimeInner};
use crate::value::Value;

struct RecordInner {
    id: RecordId,
    /// Weak: a record reachable from a subscriber closure must not keep the
    /// universe (and through its store, that subscriber) alive. A record
    /// that outlives its runtime stays readable and writable, untracked.
    runtime: Weak<RuntimeInner>,
    fields: RefCell<IndexMap<String, Value, ahash::RandomState>>,
}

/// Shared handle to an observed record.
///
/// Cloning shares the same record: clones have the same identity and the
/// same fields. Equality is identity, never structure.
#[derive(Clone)]
pub struct Record {
    inner: Rc<RecordInner>,
}

impl Record {
    pub(crate) fn new(runtime: &Runtime, id: RecordId) -> Self {
        Self {
            inner: Rc::new(RecordInner {
                id,
                runtime: Rc::downgrade(&runtime.inner),
                fields: RefCell::new(IndexMap::default()),
            }),
        }
    }

    fn track(&self, key: &FieldKey) {
        if let Some(rt) = self.inner.runtime.upgrade() {
            Runtime::from_inner(rt).track(self.inner.id, key);
        }
    }

    fn trigger(&self, key: &FieldKey, key_set_changed: bool) {
        if let Some(rt) = self.inner.runtime.upgrade() {
            Runtime::from_inner(rt).trigger(self.inner.id, key, key_set_changed);
        }
    }

    /// Identity of this record within its runtime.
    #[must_use]
    pub fn id(&self) -> RecordId {
        self.inner.id
    }

    /// Write a field without triggering. Only valid before the record is
    /// handed out, i.e. during construction.
    pub(crate) fn seed(&self, key: String, value: Value) {
        self.inner.fields.borrow_mut().insert(key, value);
    }

    /// Read a field, registering the active subscriber as a dependent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.track(&FieldKey::field(key));
        self.inner.fields.borrow().get(key).cloned()
    }

    /// Write a field, notifying its dependents.
    ///
    /// The value is stored *before* dependents run, so re-runs observe the
    /// new state. Adding a previously absent key also notifies enumeration
    /// subscribers. Every write triggers; there is no equality
    /// short-circuit.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let added = self
            .inner
            .fields
            .borrow_mut()
            .insert(key.clone(), value.into())
            .is_none();
        self.trigger(&FieldKey::Field(key), added);
    }

    /// Remove a field, notifying its dependents and enumeration subscribers.
    ///
    /// Removing an absent key is a no-op. Remaining fields keep their order.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.inner.fields.borrow_mut().shift_remove(key);
        if removed.is_some() {
            self.trigger(&FieldKey::field(key), true);
        }
        removed
    }

    /// Whether the field exists, tracked against the named field.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.track(&FieldKey::field(key));
        self.inner.fields.borrow().contains_key(key)
    }

    /// Snapshot of the field names in insertion order, tracked against the
    /// iteration key: the subscriber re-runs when the key set changes.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.track(&FieldKey::Iterate);
        self.inner.fields.borrow().keys().cloned().collect()
    }

    /// Number of fields, tracked against the iteration key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.track(&FieldKey::Iterate);
        self.inner.fields.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Record {}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.inner.id)
            .field("fields", &self.inner.fields.borrow().len())
            .finish()
    }
}

/// Single-value reactive wrapper: a record with one `"value"` field.
///
/// The record-shaped store only observes key/value structures; a bare value
/// gets reactivity by boxing it into one. Reads of [`get`](Self::get) track
/// and writes of [`set`](Self::set) trigger exactly like a field access.
#[derive(Clone, Debug)]
pub struct ReactiveCell {
    record: Record,
}

impl ReactiveCell {
    const VALUE: &'static str = "value";

    pub(crate) fn new(record: Record, initial: Value) -> Self {
        record.seed(Self::VALUE.to_owned(), initial);
        Self { record }
    }

    /// Read the wrapped value (tracked).
    #[must_use]
    pub fn get(&self) -> Value {
        self.record.get(Self::VALUE).unwrap_or_default()
    }

    /// Replace the wrapped value (triggers).
    pub fn set(&self, value: impl Into<Value>) {
        self.record.set(Self::VALUE, value);
    }

    /// The backing one-field record.
    #[must_use]
    pub fn record(&self) -> &Record {
        &self.record
    }
}
