#![forbid(unsafe_code)]

//! Deduplicated job scheduling with a deferred flush.
//!
//! A [`JobQueue`] collects trigger-driven re-runs so that a burst of
//! synchronous writes collapses into one run per subscriber. "Deferred" is
//! modeled explicitly: the queue does not own an event loop. A host that has
//! a run-after-current-work hook injects it as the *flush driver*; a host
//! (or test) without one calls [`flush`](JobQueue::flush) manually at the
//! end of its synchronous burst.
//!
//! # Invariants
//!
//! 1. N schedules of the same subscriber between two flushes produce exactly
//!    one execution.
//! 2. Jobs run in pending-set insertion order.
//! 3. Jobs scheduled *during* a flush run in the next flush, not the current
//!    one.
//! 4. A panicking job does not prevent the remaining jobs in the same flush
//!    from running.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, error};

use crate::effect::{Effect, EffectId, Scheduler};

struct QueueInner {
    pending: RefCell<IndexMap<EffectId, Effect, ahash::RandomState>>,
    flush_requested: Cell<bool>,
    /// Host hook that arranges for `flush()` to run after the current
    /// synchronous work completes.
    driver: Option<Box<dyn Fn(JobQueue)>>,
}

/// Deduplicating pending-job container plus deferred flush.
///
/// Cloning shares the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Rc<QueueInner>,
}

impl JobQueue {
    /// A queue with no driver: the owner calls [`flush`](Self::flush)
    /// manually. This is the deterministic test configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(QueueInner {
                pending: RefCell::new(IndexMap::default()),
                flush_requested: Cell::new(false),
                driver: None,
            }),
        }
    }

    /// A queue wired to the host's deferred-task mechanism.
    ///
    /// `driver` is invoked at most once per burst — on the first schedule
    /// after the previous flush — and must eventually call
    /// [`flush`](Self::flush) on the queue it is given, after the current
    /// call stack unwinds and before any later timer-based work.
    #[must_use]
    pub fn with_driver(driver: impl Fn(JobQueue) + 'static) -> Self {
        Self {
            inner: Rc::new(QueueInner {
                pending: RefCell::new(IndexMap::default()),
                flush_requested: Cell::new(false),
                driver: Some(Box::new(driver)),
            }),
        }
    }

    /// Add `job` to the pending set and request a flush if none is pending.
    pub fn schedule(&self, job: Effect) {
        self.inner.pending.borrow_mut().insert(job.id(), job);
        if !self.inner.flush_requested.get() {
            self.inner.flush_requested.set(true);
            if let Some(driver) = &self.inner.driver {
                driver(self.clone());
            }
        }
    }

    /// A [`Scheduler`] that routes a subscriber's re-runs through this queue,
    /// for use with [`crate::effect::EffectOptions::with_scheduler`].
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        let queue = self.clone();
        Rc::new(move |job| queue.schedule(job))
    }

    /// Run every currently pending job once, in insertion order.
    ///
    /// The pending set is drained into a snapshot first, so jobs that
    /// schedule further jobs push them into the *next* flush. Each job is
    /// isolated: a panic is logged and counted, and the remaining jobs still
    /// run (continue-on-error).
    pub fn flush(&self) -> FlushSummary {
        let jobs: Vec<Effect> = self
            .inner
            .pending
            .borrow_mut()
            .drain(..)
            .map(|(_, job)| job)
            .collect();
        self.inner.flush_requested.set(false);

        let mut summary = FlushSummary::default();
        for job in jobs {
            match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
                Ok(_) => summary.executed += 1,
                Err(_) => {
                    summary.panicked += 1;
                    error!(
                        effect = job.id().raw(),
                        "scheduled job panicked during flush; continuing"
                    );
                }
            }
        }
        debug!(
            executed = summary.executed,
            panicked = summary.panicked,
            "flush complete"
        );
        summary
    }

    /// Number of jobs currently pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.pending.borrow().is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("pending", &self.len())
            .field("flush_requested", &self.inner.flush_requested.get())
            .field("driven", &self.inner.driver.is_some())
            .finish()
    }
}

/// Outcome of one [`JobQueue::flush`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    /// Jobs that ran to completion.
    pub executed: usize,
    /// Jobs that panicked (isolated, logged).
    pub panicked: usize,
}
