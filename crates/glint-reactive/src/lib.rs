#![forbid(unsafe_code)]

//! Fine-grained reactive dependency tracking for Glint.
//!
//! This crate is the dataflow core consumed by the renderer and component
//! system: computations that read record fields automatically re-run when
//! those fields change, with batched re-execution, memoized derived values,
//! and deep change observation.
//!
//! - [`Runtime`]: one reactive universe — dependency store, active-subscriber
//!   stack, id allocation. Explicitly owned; universes are independent.
//! - [`Record`] / [`Value`] / [`ReactiveCell`]: observed state. Reads track,
//!   writes trigger, enumeration has its own tracking key.
//! - [`Effect`] / [`EffectOptions`]: subscribers. Dependency edges are
//!   dynamic — rebuilt from scratch on every run, so a subscriber is
//!   implicitly unsubscribed from fields it stops reading.
//! - [`JobQueue`]: deduplicated deferred re-execution; N triggers between
//!   flushes collapse to one run.
//! - [`Computed`]: lazy memoized derived value with downstream notification.
//! - [`Runtime::watch`]: old/new change callbacks over a getter or a whole
//!   record (deep, cycle-safe).
//!
//! # Design
//!
//! Everything is single-threaded cooperative: `Rc` + `RefCell`, no locking.
//! Subscriber sets are iterated only via snapshots because a running
//! subscriber mutates the graph reentrantly (cleanup and re-tracking).
//! A subscriber never synchronously re-enters itself from its own writes.
//!
//! # Example
//!
//! ```
//! use glint_reactive::{EffectOptions, JobQueue, Runtime};
//!
//! let rt = Runtime::new();
//! let state = rt.record_from([("count", 0)]);
//!
//! // Renderer-style subscriber: batched through a queue.
//! let queue = JobQueue::new();
//! let view = state.clone();
//! rt.effect(
//!     move || view.get("count").unwrap_or_default(),
//!     EffectOptions::new().with_scheduler(queue.scheduler()),
//! );
//!
//! state.set("count", 1);
//! state.set("count", 2);
//! let summary = queue.flush(); // one re-run, seeing the final value
//! assert_eq!(summary.executed, 1);
//! ```

pub mod computed;
pub mod deps;
pub mod effect;
pub mod queue;
pub mod record;
pub mod runtime;
pub mod value;
pub mod watch;

pub use computed::Computed;
pub use deps::FieldKey;
pub use effect::{Effect, EffectId, EffectOptions, Scheduler};
pub use queue::{FlushSummary, JobQueue};
pub use record::{ReactiveCell, Record};
pub use runtime::{RecordId, Runtime};
pub use value::Value;
pub use watch::{WatchOptions, WatchSource};
