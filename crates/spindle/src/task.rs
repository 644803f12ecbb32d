//! Tasks: one live traversal of a step sequence over one context.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spindle_core::{
    BranchOutcome, Context, Outcome, ResumeError, ResumeTarget, StepName, StepRef, WorkflowError,
    FAN_OUT_RESULTS,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Completion callback invoked exactly once per task.
pub type OnDone = Box<dyn FnOnce(Outcome) + Send>;

/// Process-unique task identifier, assigned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a task.
///
/// `Done` is terminal. `Cancelled` only ever moves on to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Queued or executing a step.
    Runnable,
    /// Parked on a suspension, a retry delay, or fan-out children.
    Suspended,
    /// Cancellation requested, not yet acknowledged.
    Cancelled,
    /// Finished; the completion callback has been (or is being) invoked.
    Done,
}

impl TaskState {
    /// Runnable or Suspended.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Runnable | TaskState::Suspended)
    }
}

/// State shared between a task's run record, its handles and its resumers.
pub(crate) struct TaskShared {
    pub(crate) id: TaskId,
    pub(crate) name: StepName,
    pub(crate) cancel: CancellationToken,
    pub(crate) queue: RunQueue,
    state: watch::Sender<TaskState>,
    parked: Mutex<Option<Parked>>,
    suspensions: AtomicU64,
    children: Mutex<Vec<TaskHandle>>,
}

struct Parked {
    generation: u64,
    run: TaskRun,
    /// Cancelled once this suspension is resumed, expired or cancelled.
    settled: CancellationToken,
}

impl TaskShared {
    pub(crate) fn new(id: TaskId, name: StepName, queue: RunQueue) -> Self {
        let (state, _) = watch::channel(TaskState::Runnable);
        Self {
            id,
            name,
            cancel: CancellationToken::new(),
            queue,
            state,
            parked: Mutex::new(None),
            suspensions: AtomicU64::new(0),
            children: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Moves to `next` unless the task is already Done, or Cancelled and
    /// `next` isn't Done.
    pub(crate) fn set_state(&self, next: TaskState) {
        self.state.send_if_modified(|current| {
            let allowed = match *current {
                TaskState::Done => false,
                TaskState::Cancelled => next == TaskState::Done,
                _ => *current != next,
            };
            if allowed {
                *current = next;
            }
            allowed
        });
    }

    fn request_cancel(&self) {
        if self.state() == TaskState::Done {
            return;
        }
        debug!("Cancellation requested for {}", self.id);
        self.cancel.cancel();
        self.set_state(TaskState::Cancelled);

        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            child.cancel();
        }

        // A parked task would otherwise only notice at its next resume.
        let parked = self.parked.lock().take();
        if let Some(parked) = parked {
            let _ = self.queue.push(parked.run);
        }
    }

    /// Parks `run` and returns the generation its resumer must present.
    fn park(&self, run: TaskRun) -> u64 {
        let generation = self.suspensions.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_state(TaskState::Suspended);
        *self.parked.lock() = Some(Parked {
            generation,
            run,
            settled: self.cancel.child_token(),
        });
        generation
    }

    /// Takes the parked run if it still belongs to `generation`.
    pub(crate) fn unpark(&self, generation: u64) -> Option<TaskRun> {
        let mut slot = self.parked.lock();
        if slot.as_ref().map(|p| p.generation) != Some(generation) {
            return None;
        }
        slot.take().map(|parked| {
            parked.settled.cancel();
            parked.run
        })
    }

    /// Token cancelled when suspension `generation` ends, or `None` if it
    /// already has.
    pub(crate) fn settled(&self, generation: u64) -> Option<CancellationToken> {
        self.parked
            .lock()
            .as_ref()
            .filter(|parked| parked.generation == generation)
            .map(|parked| parked.settled.clone())
    }

    fn set_children(&self, children: Vec<TaskHandle>) {
        *self.children.lock() = children;
    }

    fn clear_children(&self) {
        self.children.lock().clear();
    }
}

/// A cheap, cloneable view of a task.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    pub(crate) fn new(shared: Arc<TaskShared>) -> Self {
        Self { shared }
    }

    /// Returns the task's id.
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Name of the task's first step.
    pub fn name(&self) -> &StepName {
        &self.shared.name
    }

    /// Returns the task's current state.
    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// Returns true once the task is Done.
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Requests cooperative cancellation.
    ///
    /// The task finishes with [`Outcome::Cancelled`] at its next step
    /// boundary. A suspended or delayed task is woken so the cancellation is
    /// acknowledged without waiting for its resume or delay. Fan-out children
    /// are cancelled too. No-op once the task is Done.
    pub fn cancel(&self) {
        self.shared.request_cancel();
    }

    /// Waits until the task is Done.
    ///
    /// The completion callback may still be running when this returns.
    pub async fn wait(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == TaskState::Done).await;
    }
}

/// The movable part of a task: what runs next and over which context.
///
/// Exactly one of the run queue, a worker, the delay timer, a suspension slot
/// or a fan-out join holds it at any time.
pub(crate) struct TaskRun {
    pub(crate) shared: Arc<TaskShared>,
    pub(crate) step: StepRef,
    pub(crate) ctx: Context,
    /// Set when resumed with an error or when a suspension expires.
    pub(crate) failure: Option<WorkflowError>,
    on_done: Option<OnDone>,
}

impl TaskRun {
    pub(crate) fn new(
        shared: Arc<TaskShared>,
        step: StepRef,
        ctx: Context,
        on_done: OnDone,
    ) -> Self {
        Self {
            shared,
            step,
            ctx,
            failure: None,
            on_done: Some(on_done),
        }
    }

    /// Marks the task Done and invokes its completion callback.
    pub(crate) fn finish(mut self, outcome: Outcome) {
        self.complete(outcome);
    }

    fn complete(&mut self, outcome: Outcome) {
        let Some(on_done) = self.on_done.take() else {
            return;
        };
        self.shared.set_state(TaskState::Done);
        self.shared.clear_children();
        match &outcome {
            Outcome::Completed(_) => debug!("{} completed", self.shared.id),
            Outcome::Failed(e) => warn!("{} failed: {}", self.shared.id, e),
            Outcome::Cancelled => debug!("{} cancelled", self.shared.id),
        }
        if catch_unwind(AssertUnwindSafe(move || on_done(outcome))).is_err() {
            error!("Completion callback of {} panicked", self.shared.id);
        }
    }

    /// Parks this run on a suspension and hands out its resumer.
    pub(crate) fn suspend(self) -> (Arc<TaskShared>, u64) {
        let shared = self.shared.clone();
        let generation = shared.park(self);
        if shared.cancel.is_cancelled() {
            // Cancelled between the step boundary and parking.
            if let Some(run) = shared.unpark(generation) {
                let _ = shared.queue.push(run);
            }
        }
        (shared, generation)
    }
}

impl Drop for TaskRun {
    fn drop(&mut self) {
        // Only reached with a pending callback when the scheduler is gone.
        if self.on_done.is_some() {
            self.complete(Outcome::Failed(WorkflowError::Shutdown));
        }
    }
}

/// The queue workers pull runnable tasks from.
#[derive(Clone)]
pub(crate) struct RunQueue {
    tx: mpsc::UnboundedSender<TaskRun>,
}

impl RunQueue {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TaskRun>) -> Self {
        Self { tx }
    }

    /// Enqueues `run`. A rejected run is dropped, failing it with `Shutdown`.
    pub(crate) fn push(&self, run: TaskRun) -> Result<(), ResumeError> {
        run.shared.set_state(TaskState::Runnable);
        self.tx.send(run).map_err(|rejected| {
            debug!("Run queue closed, dropping {}", rejected.0.shared.id);
            ResumeError::Shutdown
        })
    }
}

/// Engine side of a [`spindle_core::Resumer`].
pub(crate) struct TaskResumer {
    shared: Arc<TaskShared>,
    generation: u64,
    used: bool,
}

impl TaskResumer {
    pub(crate) fn new(shared: Arc<TaskShared>, generation: u64) -> Self {
        Self {
            shared,
            generation,
            used: false,
        }
    }
}

impl ResumeTarget for TaskResumer {
    fn resume(
        mut self: Box<Self>,
        result: Result<Context, WorkflowError>,
    ) -> Result<(), ResumeError> {
        self.used = true;
        let Some(mut run) = self.shared.unpark(self.generation) else {
            debug!("Late resume of {} ignored", self.shared.id);
            return Err(ResumeError::NotSuspended);
        };
        match result {
            Ok(update) => run.ctx.merge(update),
            Err(error) => run.failure = Some(error),
        }
        self.shared.queue.push(run)
    }
}

impl Drop for TaskResumer {
    fn drop(&mut self) {
        if self.used {
            return;
        }
        if let Some(mut run) = self.shared.unpark(self.generation) {
            warn!(
                "Resumer for {} dropped while suspended before '{}'",
                self.shared.id,
                run.step.name()
            );
            let step_name = run.step.name();
            run.failure = Some(if std::thread::panicking() {
                WorkflowError::Panicked {
                    step_name,
                    details: "resumer dropped during a panic".to_string(),
                }
            } else {
                WorkflowError::Abandoned { step_name }
            });
            let _ = self.shared.queue.push(run);
        }
    }
}

/// Join bookkeeping for one fan-out.
pub(crate) struct Join {
    remaining: AtomicUsize,
    outcomes: Mutex<Vec<Option<BranchOutcome>>>,
    parent: Mutex<Option<TaskRun>>,
}

impl Join {
    pub(crate) fn new(branches: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(branches),
            outcomes: Mutex::new(vec![None; branches]),
            parent: Mutex::new(None),
        }
    }

    /// Parks the parent until every child has reported.
    pub(crate) fn hold(&self, parent: TaskRun, children: Vec<TaskHandle>) {
        parent.shared.set_state(TaskState::Suspended);
        parent.shared.set_children(children);
        let shared = parent.shared.clone();
        *self.parent.lock() = Some(parent);
        if shared.cancel.is_cancelled() {
            let children = std::mem::take(&mut *shared.children.lock());
            for child in children {
                child.cancel();
            }
        }
    }

    /// Records one child's outcome; the last one re-enqueues the parent at
    /// its join step.
    pub(crate) fn report(&self, index: usize, step_name: StepName, outcome: Outcome) {
        if let Some(slot) = self.outcomes.lock().get_mut(index) {
            *slot = Some(BranchOutcome {
                index,
                step_name,
                outcome,
            });
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let parent = self.parent.lock().take();
        let Some(mut parent) = parent else {
            error!("Fan-out finished without a parked parent");
            return;
        };
        let results: Vec<BranchOutcome> = self.outcomes.lock().drain(..).flatten().collect();
        debug!(
            "{} joined {} branches ({} failed)",
            parent.shared.id,
            results.len(),
            results.iter().filter(|r| r.outcome.is_failed()).count()
        );
        parent.shared.clear_children();
        parent.ctx.insert(FAN_OUT_RESULTS, results);
        let queue = parent.shared.queue.clone();
        let _ = queue.push(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::done;

    fn shared_with_queue() -> (Arc<TaskShared>, mpsc::UnboundedReceiver<TaskRun>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(TaskShared::new(
            TaskId::new(1),
            StepName::new("Test"),
            RunQueue::new(tx),
        ));
        (shared, rx)
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let (shared, _rx) = shared_with_queue();
        assert_eq!(shared.state(), TaskState::Runnable);

        shared.set_state(TaskState::Suspended);
        assert_eq!(shared.state(), TaskState::Suspended);

        shared.set_state(TaskState::Cancelled);
        shared.set_state(TaskState::Runnable);
        assert_eq!(shared.state(), TaskState::Cancelled);

        shared.set_state(TaskState::Done);
        shared.set_state(TaskState::Runnable);
        assert_eq!(shared.state(), TaskState::Done);
    }

    #[test]
    fn test_resume_after_unpark_is_rejected() {
        let (shared, mut rx) = shared_with_queue();
        let run = TaskRun::new(shared.clone(), Arc::new(done()), Context::new(), Box::new(|_| {}));
        let (shared, generation) = run.suspend();

        let first = spindle_core::Resumer::new(TaskResumer::new(shared.clone(), generation));
        let late = spindle_core::Resumer::new(TaskResumer::new(shared.clone(), generation));

        assert_eq!(first.wake(), Ok(()));
        assert_eq!(late.wake(), Err(ResumeError::NotSuspended));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_resumer_abandons_suspension() {
        let (shared, mut rx) = shared_with_queue();
        let run = TaskRun::new(shared.clone(), Arc::new(done()), Context::new(), Box::new(|_| {}));
        let (shared, generation) = run.suspend();
        assert_eq!(shared.state(), TaskState::Suspended);

        drop(TaskResumer::new(shared, generation));

        let run = rx.try_recv().unwrap();
        assert!(matches!(run.failure, Some(WorkflowError::Abandoned { .. })));
    }

    #[test]
    fn test_dropped_run_reports_shutdown() {
        let (shared, _rx) = shared_with_queue();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let run = TaskRun::new(
            shared.clone(),
            Arc::new(done()),
            Context::new(),
            Box::new(move |outcome| *sink.lock() = Some(outcome)),
        );

        drop(run);

        assert_eq!(shared.state(), TaskState::Done);
        assert!(matches!(
            seen.lock().take(),
            Some(Outcome::Failed(WorkflowError::Shutdown))
        ));
    }

    #[test]
    fn test_resume_settles_suspension() {
        let (shared, _rx) = shared_with_queue();
        let run = TaskRun::new(shared.clone(), Arc::new(done()), Context::new(), Box::new(|_| {}));
        let (shared, generation) = run.suspend();
        let settled = shared.settled(generation).unwrap();
        assert!(!settled.is_cancelled());

        let resumer = spindle_core::Resumer::new(TaskResumer::new(shared.clone(), generation));
        assert_eq!(resumer.wake(), Ok(()));

        assert!(settled.is_cancelled());
        assert!(shared.settled(generation).is_none());
    }

    #[test]
    fn test_last_report_requeues_parent_with_results() {
        let (shared, mut rx) = shared_with_queue();
        let parent = TaskRun::new(shared.clone(), Arc::new(done()), Context::new(), Box::new(|_| {}));
        let join = Join::new(2);
        join.hold(parent, Vec::new());
        assert_eq!(shared.state(), TaskState::Suspended);

        let abandoned = WorkflowError::Abandoned {
            step_name: StepName::new("Read"),
        };
        join.report(1, StepName::new("Read"), Outcome::Failed(abandoned));
        assert!(rx.try_recv().is_err());

        join.report(0, StepName::new("Write"), Outcome::Completed(Context::new()));
        let parent = rx.try_recv().unwrap();
        assert_eq!(shared.state(), TaskState::Runnable);

        let results = parent.ctx.fan_out_results().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 0);
        assert!(results[0].outcome.is_completed());
        assert!(matches!(
            results[1].outcome.error(),
            Some(WorkflowError::Abandoned { .. })
        ));
    }

    #[test]
    fn test_active_states() {
        assert!(TaskState::Runnable.is_active());
        assert!(TaskState::Suspended.is_active());
        assert!(!TaskState::Cancelled.is_active());
        assert!(!TaskState::Done.is_active());
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId::new(42);
        assert_eq!(id.to_string(), "task-42");
        assert_eq!(id.as_u64(), 42);
    }
}
