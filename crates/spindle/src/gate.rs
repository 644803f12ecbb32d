//! Per-resource admission control.
//!
//! A [`ResourceGate`] lets at most one task per resource key be active at a
//! time. Further requests for a busy key wait in that key's FIFO queue and are
//! admitted one by one as the active task finishes.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use spindle_core::{Context, Outcome, StepRef};
use tracing::{debug, error, info};

use crate::scheduler::Scheduler;
use crate::task::{OnDone, TaskHandle, TaskRun};

/// Result of asking the gate to run a task.
#[derive(Debug, Clone)]
pub enum Admission {
    /// The key was idle and the task was started.
    Started(TaskHandle),
    /// The key is busy; the request waits at `position` (1 = next).
    Queued { position: usize },
}

impl Admission {
    /// Returns true if the task was started right away.
    pub fn is_started(&self) -> bool {
        matches!(self, Admission::Started(_))
    }

    /// The started task's handle; `None` while queued.
    pub fn handle(&self) -> Option<&TaskHandle> {
        match self {
            Admission::Started(handle) => Some(handle),
            Admission::Queued { .. } => None,
        }
    }
}

struct Pending {
    step: StepRef,
    ctx: Context,
    on_done: OnDone,
}

struct GateEntry {
    active: TaskHandle,
    queue: VecDeque<Pending>,
}

/// Serializes tasks per resource key on top of a [`Scheduler`].
///
/// ```rust,no_run
/// use spindle::prelude::*;
/// use std::sync::Arc;
///
/// # fn demo(scheduler: Scheduler, reconcile: StepRef) {
/// let gate = ResourceGate::new(scheduler);
/// let first = gate.admit_or_queue("default/web-0", reconcile.clone(), Context::new(), |_| {});
/// let second = gate.admit_or_queue("default/web-0", reconcile, Context::new(), |_| {});
/// assert!(first.is_started());
/// assert!(!second.is_started());
/// # }
/// ```
#[derive(Clone)]
pub struct ResourceGate {
    scheduler: Scheduler,
    entries: Arc<Mutex<HashMap<String, GateEntry>>>,
}

impl fmt::Debug for ResourceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGate")
            .field("keys", &self.entries.lock().len())
            .finish()
    }
}

impl ResourceGate {
    /// Creates a new gate with no busy keys, running tasks on `scheduler`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts the task if `key` is idle, otherwise queues it behind the
    /// key's active task and any earlier requests.
    pub fn admit_or_queue(
        &self,
        key: impl Into<String>,
        step: StepRef,
        ctx: Context,
        on_done: impl FnOnce(Outcome) + Send + 'static,
    ) -> Admission {
        let key = key.into();
        let pending = Pending {
            step,
            ctx,
            on_done: Box::new(on_done),
        };

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.queue.push_back(pending);
            let position = entry.queue.len();
            debug!("Queued request for '{}' at position {}", key, position);
            return Admission::Queued { position };
        }
        let (run, handle) = self.admit(&mut entries, key, pending);
        drop(entries);

        self.scheduler.submit(run);
        Admission::Started(handle)
    }

    /// Cancels the key's active task and puts this request first in line.
    ///
    /// Never waits for the cancellation; the replacement starts as soon as
    /// the cancelled task acknowledges it. An idle key starts the task now.
    pub fn cancel_and_replace(
        &self,
        key: impl Into<String>,
        step: StepRef,
        ctx: Context,
        on_done: impl FnOnce(Outcome) + Send + 'static,
    ) -> Admission {
        let key = key.into();
        let pending = Pending {
            step,
            ctx,
            on_done: Box::new(on_done),
        };

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.queue.push_front(pending);
            let superseded = entry.active.clone();
            drop(entries);

            info!("Superseding {} for '{}'", superseded.id(), key);
            superseded.cancel();
            return Admission::Queued { position: 1 };
        }
        let (run, handle) = self.admit(&mut entries, key, pending);
        drop(entries);

        self.scheduler.submit(run);
        Admission::Started(handle)
    }

    /// Starts the task only if `key` is idle; otherwise the request is
    /// dropped and `on_done` is never called.
    pub fn try_admit(
        &self,
        key: impl Into<String>,
        step: StepRef,
        ctx: Context,
        on_done: impl FnOnce(Outcome) + Send + 'static,
    ) -> Option<TaskHandle> {
        let key = key.into();
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            debug!("'{}' is busy, not starting", key);
            return None;
        }
        let pending = Pending {
            step,
            ctx,
            on_done: Box::new(on_done),
        };
        let (run, handle) = self.admit(&mut entries, key, pending);
        drop(entries);

        self.scheduler.submit(run);
        Some(handle)
    }

    /// The key's active task, if any.
    pub fn active(&self, key: &str) -> Option<TaskHandle> {
        self.entries.lock().get(key).map(|entry| entry.active.clone())
    }

    /// Number of requests waiting behind the key's active task.
    pub fn queued(&self, key: &str) -> usize {
        self.entries
            .lock()
            .get(key)
            .map_or(0, |entry| entry.queue.len())
    }

    /// Snapshot of every busy key and its active task.
    pub fn current_tasks(&self) -> HashMap<String, TaskHandle> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.active.clone()))
            .collect()
    }

    /// Returns true if no key has an active task.
    pub fn is_idle(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Records `pending` as the key's active task. The caller submits the
    /// returned run after releasing the lock.
    fn admit(
        &self,
        entries: &mut HashMap<String, GateEntry>,
        key: String,
        pending: Pending,
    ) -> (TaskRun, TaskHandle) {
        let (run, handle) = self.prepare(key.clone(), pending);
        debug!("Admitted {} for '{}'", handle.id(), key);
        entries.insert(
            key,
            GateEntry {
                active: handle.clone(),
                queue: VecDeque::new(),
            },
        );
        (run, handle)
    }

    fn prepare(&self, key: String, pending: Pending) -> (TaskRun, TaskHandle) {
        let Pending { step, ctx, on_done } = pending;
        let gate = self.clone();
        self.scheduler.prepare(
            step,
            ctx,
            Box::new(move |outcome| {
                if catch_unwind(AssertUnwindSafe(move || on_done(outcome))).is_err() {
                    error!("Completion callback for '{}' panicked", key);
                }
                gate.advance(&key);
            }),
        )
    }

    /// Admits the next queued request for `key`, or frees the key.
    fn advance(&self, key: &str) {
        let next = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            if !entry.active.is_finished() {
                error!("'{}' advanced while {} is still active", key, entry.active.id());
                return;
            }
            match entry.queue.pop_front() {
                Some(pending) => {
                    let (run, handle) = self.prepare(key.to_string(), pending);
                    debug!("Admitted {} for '{}' from queue", handle.id(), key);
                    entry.active = handle;
                    Some(run)
                }
                None => {
                    debug!("'{}' is idle", key);
                    entries.remove(key);
                    None
                }
            }
        };
        if let Some(run) = next {
            self.scheduler.submit(run);
        }
    }
}
