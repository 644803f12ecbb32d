//! One-shot delays: retry backoff and suspension timeouts.

use std::sync::Arc;
use std::time::Duration;

use spindle_core::WorkflowError;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::task::{TaskRun, TaskShared};

/// Re-enqueues tasks after a delay, without occupying a worker.
#[derive(Clone)]
pub(crate) struct DelayTimer {
    runtime: Handle,
}

impl DelayTimer {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Enqueues `run` once `after` has elapsed, or as soon as it's cancelled.
    pub(crate) fn schedule(&self, after: Duration, run: TaskRun) {
        debug!(
            "{} retrying '{}' in {:?}",
            run.shared.id,
            run.step.name(),
            after
        );
        run.shared.set_state(crate::TaskState::Suspended);
        let cancel = run.shared.cancel.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {}
                _ = cancel.cancelled() => {}
            }
            let queue = run.shared.queue.clone();
            let _ = queue.push(run);
        });
    }

    /// Fails suspension `generation` of `shared` with a timeout unless it has
    /// been resumed or cancelled by then.
    pub(crate) fn expire(&self, shared: Arc<TaskShared>, generation: u64, after: Duration) {
        let Some(settled) = shared.settled(generation) else {
            return;
        };
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {}
                // resumed, or cancelled (which wakes the parked run itself)
                _ = settled.cancelled() => return,
            }
            if let Some(mut run) = shared.unpark(generation) {
                warn!(
                    "{} suspension before '{}' timed out after {:?}",
                    shared.id,
                    run.step.name(),
                    after
                );
                run.failure = Some(WorkflowError::Timeout {
                    step_name: run.step.name(),
                });
                let _ = shared.queue.push(run);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{RunQueue, TaskId};
    use spindle_core::{done, Context, StepName};
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn task() -> (Arc<TaskShared>, TaskRun, mpsc::UnboundedReceiver<TaskRun>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(TaskShared::new(
            TaskId::new(7),
            StepName::new("Timer"),
            RunQueue::new(tx),
        ));
        let run = TaskRun::new(shared.clone(), Arc::new(done()), Context::new(), Box::new(|_| {}));
        (shared, run, rx)
    }

    #[tokio::test]
    async fn test_schedule_waits_for_delay() {
        let timer = DelayTimer::new(Handle::current());
        let (_shared, run, mut rx) = task();

        let started = Instant::now();
        timer.schedule(Duration::from_millis(50), run);
        let run = rx.recv().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(run.failure.is_none());
    }

    #[tokio::test]
    async fn test_schedule_cut_short_by_cancel() {
        let timer = DelayTimer::new(Handle::current());
        let (shared, run, mut rx) = task();

        timer.schedule(Duration::from_secs(60), run);
        shared.cancel.cancel();

        let woken = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(woken, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_expire_fails_parked_run() {
        let timer = DelayTimer::new(Handle::current());
        let (_shared, run, mut rx) = task();

        let (shared, generation) = run.suspend();
        timer.expire(shared, generation, Duration::from_millis(10));

        let run = rx.recv().await.unwrap();
        assert!(matches!(run.failure, Some(WorkflowError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_expire_released_on_resume() {
        let timer = DelayTimer::new(Handle::current());
        let (_shared, run, _rx) = task();

        let (shared, generation) = run.suspend();
        timer.expire(shared.clone(), generation, Duration::from_secs(60));
        let run = shared.unpark(generation).unwrap();
        drop(run);

        let released = tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&shared) > 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(released.is_ok());
    }
}
