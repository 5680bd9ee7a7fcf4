#![forbid(unsafe_code)]

//! Dependency store: the `record → (field → subscriber-set)` mapping.
//!
//! The store owns the forward edges of the dataflow graph. Reverse edges
//! live on each subscriber (its `deps` list) so a re-run can remove itself
//! from every set it belongs to in O(edges) before rebuilding. Reverse
//! edges are weak: the sets hold the only strong subscriber references, so
//! ownership flows one way (store → set → subscriber) and tearing the
//! store down frees the subscribers with it.
//!
//! # Invariants
//!
//! 1. After any subscriber run completes, its membership here equals exactly
//!    the set of fields it read during that run (cleanup before re-run).
//! 2. The store holds no strong reference to record *data* — it is keyed by
//!    [`RecordId`], so observing a record never keeps it alive.
//! 3. [`DepStore::snapshot`] returns an independent, deduplicated container:
//!    callers may mutate the live sets while iterating it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use indexmap::IndexMap;
use tracing::trace;

use crate::effect::{EffectId, EffectInner};
use crate::runtime::RecordId;

/// Members of one per-field subscriber set. Insertion-ordered so trigger
/// dispatch and snapshot order are deterministic.
pub(crate) type DepMap = IndexMap<EffectId, Rc<EffectInner>, ahash::RandomState>;

/// Shared handle to one per-field subscriber set.
pub(crate) type DepSet = Rc<RefCell<DepMap>>;

/// Reverse-edge handle held by a subscriber. Weak so the subscriber never
/// owns the set it belongs to.
pub(crate) type WeakDepSet = Weak<RefCell<DepMap>>;

/// Tracking key for a record field.
///
/// `Iterate` is the opaque marker for "the record's key set changed"; it can
/// never collide with a real field name, so enumeration-style reads are
/// tracked and invalidated independently of any single field's value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKey {
    /// A named field.
    Field(String),
    /// The synthetic key-set-enumeration slot.
    Iterate,
}

impl FieldKey {
    #[must_use]
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }
}

/// Forward-edge storage for one reactive universe.
pub(crate) struct DepStore {
    records: RefCell<AHashMap<RecordId, AHashMap<FieldKey, DepSet>>>,
}

impl DepStore {
    pub(crate) fn new() -> Self {
        Self {
            records: RefCell::new(AHashMap::new()),
        }
    }

    /// Register `active` as a dependent of `(record, key)`.
    ///
    /// Adds the subscriber to the per-field set and pushes that set onto the
    /// subscriber's reverse-edge list. Repeated reads of the same field in
    /// one run are absorbed by set semantics; the reverse-edge list may hold
    /// the same set more than once, which cleanup tolerates idempotently.
    pub(crate) fn track(&self, active: &Rc<EffectInner>, record: RecordId, key: &FieldKey) {
        let set = {
            let mut records = self.records.borrow_mut();
            let fields = records.entry(record).or_default();
            Rc::clone(
                fields
                    .entry(key.clone())
                    .or_insert_with(|| Rc::new(RefCell::new(IndexMap::default()))),
            )
        };
        set.borrow_mut().insert(active.id(), Rc::clone(active));
        active.push_dep(&set);
        trace!(record = record.raw(), ?key, effect = active.id().raw(), "track");
    }

    /// Build the run-set for a write to `(record, key)`.
    ///
    /// The result is the union of the field's subscribers and, when
    /// `key_set_changed`, the `Iterate` subscribers — deduplicated by
    /// subscriber identity and snapshotted before any of them runs, since a
    /// running subscriber re-tracks and cleans up reentrantly.
    pub(crate) fn snapshot(
        &self,
        record: RecordId,
        key: &FieldKey,
        key_set_changed: bool,
    ) -> Vec<Rc<EffectInner>> {
        let records = self.records.borrow();
        let Some(fields) = records.get(&record) else {
            return Vec::new();
        };

        let mut run: DepMap = IndexMap::default();
        if let Some(set) = fields.get(key) {
            for (id, sub) in set.borrow().iter() {
                run.insert(*id, Rc::clone(sub));
            }
        }
        if key_set_changed && *key != FieldKey::Iterate {
            if let Some(set) = fields.get(&FieldKey::Iterate) {
                for (id, sub) in set.borrow().iter() {
                    run.insert(*id, Rc::clone(sub));
                }
            }
        }
        run.into_values().collect()
    }

    /// Drop empty subscriber sets and record entries with no sets left.
    /// Returns the number of record entries removed.
    ///
    /// Entries go empty when subscribers stop reading a field (edge pruning)
    /// or stop existing; records themselves never notify the store, so with
    /// record churn the map only shrinks through this sweep. Reverse edges
    /// still pointing at a dropped set fail to upgrade during cleanup, which
    /// tolerates that.
    pub(crate) fn prune(&self) -> usize {
        let mut records = self.records.borrow_mut();
        let before = records.len();
        records.retain(|_, fields| {
            fields.retain(|_, set| !set.borrow().is_empty());
            !fields.is_empty()
        });
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_key_never_collides_with_iterate() {
        // No string spells the iteration marker.
        assert_ne!(FieldKey::field("Iterate"), FieldKey::Iterate);
        assert_ne!(FieldKey::field(""), FieldKey::Iterate);
    }

    #[test]
    fn snapshot_of_unknown_record_is_empty() {
        let store = DepStore::new();
        let run = store.snapshot(RecordId::new(99), &FieldKey::field("x"), true);
        assert!(run.is_empty());
    }
}
