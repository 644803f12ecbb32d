//! The worker pool that drives tasks one step at a time.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use spindle_core::{
    Action, Branch, BranchOutcome, Context, Outcome, Resumer, StepRef, Suspension, WorkflowError,
    FAN_OUT_RESULTS,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::SchedulerConfig;
use crate::task::{
    Join, OnDone, RunQueue, TaskHandle, TaskId, TaskResumer, TaskRun, TaskShared, TaskState,
};
use crate::timer::DelayTimer;

type Receiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<TaskRun>>>;

/// Runs tasks on a fixed pool of tokio worker tasks.
///
/// Cloning is cheap; clones share the same workers and run queue. Workers
/// live until [`Scheduler::shutdown`] is called or the runtime stops.
///
/// ```rust,no_run
/// use spindle::prelude::*;
/// use std::sync::Arc;
///
/// # async fn demo() -> Result<(), WorkflowError> {
/// let scheduler = Scheduler::new(SchedulerConfig::default())?;
/// let outcome = scheduler
///     .run(Arc::new(from_fn("Hello", |_ctx: &mut Context| Ok(Action::Done))), Context::new())
///     .await;
/// assert!(outcome.is_completed());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    queue: RunQueue,
    timer: DelayTimer,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Scheduler {
    /// Validates `config` and spawns the workers on the current tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self, WorkflowError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            WorkflowError::Configuration(
                "a scheduler must be created inside a tokio runtime".to_string(),
            )
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(Inner {
                queue: RunQueue::new(tx),
                timer: DelayTimer::new(runtime.clone()),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                config,
            }),
        };

        let rx: Receiver = Arc::new(AsyncMutex::new(rx));
        for worker in 0..scheduler.inner.config.workers {
            let scheduler = scheduler.clone();
            let rx = rx.clone();
            runtime.spawn(async move { scheduler.work(worker, rx).await });
        }
        info!(
            "Scheduler '{}' started with {} workers",
            scheduler.inner.config.name, scheduler.inner.config.workers
        );
        Ok(scheduler)
    }

    /// Returns the configuration the scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Starts a task at `step` over `ctx`.
    ///
    /// `on_done` is invoked exactly once with the task's outcome, on whichever
    /// worker finishes it.
    pub fn start(
        &self,
        step: StepRef,
        ctx: Context,
        on_done: impl FnOnce(Outcome) + Send + 'static,
    ) -> TaskHandle {
        let (run, handle) = self.prepare(step, ctx, Box::new(on_done));
        info!("Starting {} at '{}'", handle.id(), handle.name());
        self.submit(run);
        handle
    }

    /// Starts a task and waits for its outcome.
    pub async fn run(&self, step: StepRef, ctx: Context) -> Outcome {
        let (tx, rx) = oneshot::channel();
        self.start(step, ctx, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(Outcome::Failed(WorkflowError::Shutdown))
    }

    /// Stops the workers once their current step sequence yields.
    ///
    /// Tasks still queued, delayed or started afterwards finish with
    /// [`WorkflowError::Shutdown`]. Suspended tasks keep their resumers; a
    /// later resume fails them the same way.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Scheduler '{}' shutting down", self.inner.config.name);
            self.inner.shutdown.cancel();
        }
    }

    /// Returns true once [`Scheduler::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Creates a task without enqueueing it.
    pub(crate) fn prepare(
        &self,
        step: StepRef,
        ctx: Context,
        on_done: OnDone,
    ) -> (TaskRun, TaskHandle) {
        let id = TaskId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let shared = Arc::new(TaskShared::new(id, step.name(), self.inner.queue.clone()));
        let handle = TaskHandle::new(shared.clone());
        (TaskRun::new(shared, step, ctx, on_done), handle)
    }

    pub(crate) fn submit(&self, run: TaskRun) {
        let _ = self.inner.queue.push(run);
    }

    async fn work(self, worker: usize, rx: Receiver) {
        debug!("Worker {} started", worker);
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                run = async { rx.lock().await.recv().await } => run,
            };
            let Some(run) = next else { break };
            let span = info_span!("task", id = %run.shared.id, workflow = %run.shared.name);
            self.drive(run).instrument(span).await;
        }
        debug!("Worker {} stopped", worker);
    }

    /// Runs steps until the task finishes or hands itself to a suspension,
    /// the delay timer or a fan-out join.
    async fn drive(&self, mut run: TaskRun) {
        loop {
            if run.shared.cancel.is_cancelled() {
                debug!("Cancelled before '{}'", run.step.name());
                return run.finish(Outcome::Cancelled);
            }
            if let Some(error) = run.failure.take() {
                return run.finish(Outcome::Failed(error));
            }
            if self.inner.shutdown.is_cancelled() {
                return run.finish(Outcome::Failed(WorkflowError::Shutdown));
            }
            run.shared.set_state(TaskState::Runnable);

            let step = run.step.clone();
            let step_name = step.name();
            let result = AssertUnwindSafe(step.execute(&mut run.ctx))
                .catch_unwind()
                .await;
            let action = match result {
                Ok(Ok(action)) => action,
                Ok(Err(e)) => {
                    debug!("Step '{}' returned an error", step_name);
                    return run.finish(Outcome::Failed(e));
                }
                Err(payload) => {
                    let details = panic_details(payload.as_ref());
                    error!("Step '{}' panicked: {}", step_name, details);
                    return run.finish(Outcome::Failed(WorkflowError::Panicked {
                        step_name,
                        details,
                    }));
                }
            };
            debug!("Step '{}' completed with {}", step_name, action.kind());

            match action {
                Action::Continue(next) => run.step = next,
                Action::Done => {
                    let ctx = std::mem::take(&mut run.ctx);
                    return run.finish(Outcome::Completed(ctx));
                }
                Action::Retry { after, step } => {
                    run.step = step;
                    return self.inner.timer.schedule(after, run);
                }
                Action::Suspend(suspension) => return self.suspend(run, suspension),
                Action::FanOut { branches, join } => {
                    run.step = join;
                    if branches.is_empty() {
                        run.ctx.insert(FAN_OUT_RESULTS, Vec::<BranchOutcome>::new());
                        continue;
                    }
                    return self.fan_out(run, branches);
                }
            }
        }
    }

    fn suspend(&self, mut run: TaskRun, suspension: Suspension) {
        let (next, register, timeout) = suspension.into_parts();
        run.step = next;
        let timeout = timeout.or(self.inner.config.suspend_timeout);
        debug!("Suspending before '{}'", run.step.name());

        let (shared, generation) = run.suspend();
        if let Some(after) = timeout {
            self.inner.timer.expire(shared.clone(), generation, after);
        }
        let resumer = Resumer::new(TaskResumer::new(shared, generation));
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || register(resumer))) {
            error!(
                "Suspension registration panicked: {}",
                panic_details(payload.as_ref())
            );
        }
    }

    fn fan_out(&self, run: TaskRun, branches: Vec<Branch>) {
        debug!(
            "Fanning out {} branches, joining at '{}'",
            branches.len(),
            run.step.name()
        );
        let join = Arc::new(Join::new(branches.len()));
        let mut children = Vec::with_capacity(branches.len());
        for (index, branch) in branches.into_iter().enumerate() {
            let (step, ctx) = branch.into_parts();
            let ctx = ctx.unwrap_or_else(|| run.ctx.fork());
            let step_name = step.name();
            let join = join.clone();
            children.push(self.prepare(
                step,
                ctx,
                Box::new(move |outcome| join.report(index, step_name, outcome)),
            ));
        }

        let handles = children.iter().map(|(_, handle)| handle.clone()).collect();
        join.hold(run, handles);
        for (child, _) in children {
            self.submit(child);
        }
    }
}

fn panic_details(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
