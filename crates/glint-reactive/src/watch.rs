#![forbid(unsafe_code)]

//! Old/new change observation over a getter or a whole record.
//!
//! `watch` pairs a lazy subscriber with a callback. The subscriber's getter
//! is either caller-supplied or, for a record source, a full traversal that
//! reads every reachable field purely to establish tracking edges — its
//! return value is discarded, so deep watchers observe *that* something
//! changed, not *what*.
//!
//! The initial run happens manually (bypassing the scheduler) to capture the
//! starting value and the starting edge set without firing the callback.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashSet;

use crate::effect::{Effect, EffectOptions, Scheduler};
use crate::record::Record;
use crate::runtime::{RecordId, Runtime};
use crate::value::Value;

/// What a watcher observes.
pub enum WatchSource {
    /// A getter; its return value becomes the watched value.
    Getter(Box<dyn FnMut() -> Value>),
    /// A record; every reachable nested field is watched.
    Record(Record),
}

impl WatchSource {
    /// Wrap a getter closure.
    #[must_use]
    pub fn getter(f: impl FnMut() -> Value + 'static) -> Self {
        Self::Getter(Box::new(f))
    }
}

impl From<Record> for WatchSource {
    fn from(record: Record) -> Self {
        Self::Record(record)
    }
}

impl From<&Record> for WatchSource {
    fn from(record: &Record) -> Self {
        Self::Record(record.clone())
    }
}

/// Configuration for [`Runtime::watch`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WatchOptions {
    /// Fire the callback once at registration, with [`Value::Null`] as the
    /// old value, before any change occurs.
    pub immediate: bool,
}

impl WatchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}

type WatchCallback = Box<dyn FnMut(Value, Value)>;

pub(crate) fn register(
    runtime: &Runtime,
    source: WatchSource,
    callback: WatchCallback,
    options: WatchOptions,
) -> Effect {
    let getter: Box<dyn FnMut() -> Value> = match source {
        WatchSource::Getter(getter) => getter,
        WatchSource::Record(record) => Box::new(move || {
            traverse(&record);
            Value::Null
        }),
    };

    let old = Rc::new(RefCell::new(Value::Null));
    let callback = Rc::new(RefCell::new(callback));

    // Only trigger dispatch reaches this scheduler, and it hands over the
    // watcher's own subscriber: re-run it for the fresh value, report the
    // pair, advance the baseline.
    let scheduler: Scheduler = {
        let old = Rc::clone(&old);
        let callback = Rc::clone(&callback);
        Rc::new(move |job: Effect| {
            let new = job.run();
            let previous = old.replace(new.clone());
            (callback.borrow_mut())(previous, new);
        })
    };

    let effect = runtime.effect(getter, EffectOptions::new().lazy().with_scheduler(scheduler));

    // Manual initial run: establishes the baseline and the initial edges
    // without going through the scheduler, so the callback stays silent.
    *old.borrow_mut() = effect.run();

    if options.immediate {
        let current = old.borrow().clone();
        (callback.borrow_mut())(Value::Null, current);
    }
    effect
}

/// Read every field reachable from `record`, recursing into nested records,
/// purely for the tracking side effects. The seen-set guards against cyclic
/// structures; traversal stops at non-record values.
fn traverse(record: &Record) {
    let mut seen: AHashSet<RecordId> = AHashSet::new();
    traverse_inner(record, &mut seen);
}

fn traverse_inner(record: &Record, seen: &mut AHashSet<RecordId>) {
    if !seen.insert(record.id()) {
        return;
    }
    // keys() tracks the iteration key, so added/removed fields also wake
    // the watcher; each get() tracks the individual field.
    for key in record.keys() {
        if let Some(Value::Record(child)) = record.get(&key) {
            traverse_inner(&child, seen);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getter_watch_reports_old_new_pairs() {
        let rt = Runtime::new();
        let view = rt.record_from([("n", 1)]);

        let pairs = Rc::new(RefCell::new(Vec::new()));
        let p = Rc::clone(&pairs);
        let v = view.clone();
        rt.watch(
            WatchSource::getter(move || v.get("n").unwrap_or_default()),
            move |old, new| p.borrow_mut().push((old, new)),
            WatchOptions::new(),
        );
        assert!(pairs.borrow().is_empty(), "initial run stays silent");

        view.set("n", 2);
        view.set("n", 5);
        assert_eq!(
            *pairs.borrow(),
            vec![
                (Value::Int(1), Value::Int(2)),
                (Value::Int(2), Value::Int(5)),
            ]
        );
    }

    #[test]
    fn immediate_fires_with_null_old_value() {
        let rt = Runtime::new();
        let view = rt.record_from([("n", 7)]);

        let pairs = Rc::new(RefCell::new(Vec::new()));
        let p = Rc::clone(&pairs);
        let v = view.clone();
        rt.watch(
            WatchSource::getter(move || v.get("n").unwrap_or_default()),
            move |old, new| p.borrow_mut().push((old, new)),
            WatchOptions::new().immediate(),
        );
        assert_eq!(*pairs.borrow(), vec![(Value::Null, Value::Int(7))]);
    }

    #[test]
    fn deep_watch_sees_nested_mutation() {
        let rt = Runtime::new();
        let nested = rt.record_from([("v", 1)]);
        let view = rt.record_from([("nested", nested.clone())]);

        let fired = Rc::new(RefCell::new(0u32));
        let f = Rc::clone(&fired);
        rt.watch(
            &view,
            move |_old, _new| *f.borrow_mut() += 1,
            WatchOptions::new(),
        );

        // The watcher's getter never names `nested.v`, yet the traversal
        // established the edge.
        nested.set("v", 2);
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn deep_watch_sees_added_and_removed_fields() {
        let rt = Runtime::new();
        let view = rt.record_from([("a", 1)]);

        let fired = Rc::new(RefCell::new(0u32));
        let f = Rc::clone(&fired);
        rt.watch(
            &view,
            move |_old, _new| *f.borrow_mut() += 1,
            WatchOptions::new(),
        );

        view.set("b", 2);
        assert_eq!(*fired.borrow(), 1, "added field wakes the watcher");
        view.remove("a");
        assert_eq!(*fired.borrow(), 2, "removed field wakes the watcher");
    }

    #[test]
    fn deep_watch_follows_records_attached_later() {
        let rt = Runtime::new();
        let view = rt.record();

        let fired = Rc::new(RefCell::new(0u32));
        let f = Rc::clone(&fired);
        rt.watch(
            &view,
            move |_old, _new| *f.borrow_mut() += 1,
            WatchOptions::new(),
        );

        // Attaching a nested record is itself a change...
        let child = rt.record_from([("x", 1)]);
        view.set("child", child.clone());
        assert_eq!(*fired.borrow(), 1);

        // ...and the re-run traversal picked up the new record's fields.
        child.set("x", 2);
        assert_eq!(*fired.borrow(), 2);
    }

    #[test]
    fn cyclic_records_terminate() {
        let rt = Runtime::new();
        let a = rt.record();
        let b = rt.record();
        a.set("b", b.clone());
        b.set("a", a.clone());
        b.set("n", 1);

        let fired = Rc::new(RefCell::new(0u32));
        let f = Rc::clone(&fired);
        rt.watch(
            &a,
            move |_old, _new| *f.borrow_mut() += 1,
            WatchOptions::new(),
        );

        b.set("n", 2);
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn separate_bursts_are_not_batched() {
        // Inline watcher (no queue): each write is its own burst and its own
        // callback; two changes never collapse into one old/new pair.
        let rt = Runtime::new();
        let view = rt.record_from([("n", 1)]);

        let pairs = Rc::new(RefCell::new(Vec::new()));
        let p = Rc::clone(&pairs);
        let v = view.clone();
        rt.watch(
            WatchSource::getter(move || v.get("n").unwrap_or_default()),
            move |old, new| p.borrow_mut().push((old, new)),
            WatchOptions::new(),
        );

        view.set("n", 2);
        assert_eq!(pairs.borrow().len(), 1);
        view.set("n", 3);
        assert_eq!(pairs.borrow().len(), 2);
        assert_eq!(pairs.borrow()[1], (Value::Int(2), Value::Int(3)));
    }
}
