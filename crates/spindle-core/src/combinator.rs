//! Helpers for composing steps without hand-wiring successors.
//!
//! ```
//! use spindle_core::{chain, from_fn, sequence, when, Action, Context};
//!
//! let read = from_fn("ReadPod", |ctx: &mut Context| {
//!     ctx.insert("exists", false);
//!     Ok(Action::Done)
//! });
//! let create = from_fn("CreatePod", |_ctx: &mut Context| Ok(Action::Done));
//! let patch = from_fn("PatchPod", |_ctx: &mut Context| Ok(Action::Done));
//!
//! let reconcile = chain(
//!     read,
//!     when(
//!         |ctx: &Context| ctx.get::<bool>("exists") == Some(&true),
//!         patch,
//!         create,
//!     ),
//! );
//! let _workflow = sequence(vec![spindle_core::step_ref(reconcile)]);
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::action::{Action, Branch};
use crate::context::Context;
use crate::error::WorkflowError;
use crate::step::{Step, StepName, StepRef};

/// Runs `step`, then `next` once `step`'s own continuation finishes.
#[derive(Debug, Clone)]
pub struct Chain {
    step: StepRef,
    next: StepRef,
}

impl Chain {
    /// Creates a new chain running `step`, then `next`.
    pub fn new(step: StepRef, next: StepRef) -> Self {
        Self { step, next }
    }
}

#[async_trait]
impl Step for Chain {
    async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
        let action = self.step.execute(ctx).await?;
        Ok(action.then(self.next.clone()))
    }

    fn name(&self) -> StepName {
        self.step.name()
    }
}

/// Appends a fixed successor to `step`.
pub fn chain(step: impl Step + 'static, next: impl Step + 'static) -> Chain {
    Chain::new(Arc::new(step), Arc::new(next))
}

/// Runs `steps` one after another. An empty sequence finishes immediately.
pub fn sequence(steps: impl IntoIterator<Item = StepRef>) -> StepRef {
    let steps: Vec<StepRef> = steps.into_iter().collect();
    let mut rest = steps.into_iter().rev();
    let Some(last) = rest.next() else {
        return Arc::new(Finish);
    };
    rest.fold(last, |next, step| -> StepRef { Arc::new(Chain::new(step, next)) })
}

type Predicate = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Continues at one of two steps depending on a predicate over the context.
#[derive(Clone)]
pub struct Conditional {
    predicate: Predicate,
    if_true: StepRef,
    if_false: StepRef,
}

impl fmt::Debug for Conditional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conditional")
            .field("if_true", &self.if_true.name())
            .field("if_false", &self.if_false.name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for Conditional {
    async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
        let next = if (self.predicate)(ctx) {
            self.if_true.clone()
        } else {
            self.if_false.clone()
        };
        Ok(Action::Continue(next))
    }

    fn name(&self) -> StepName {
        StepName::new(format!("when({}|{})", self.if_true.name(), self.if_false.name()))
    }
}

/// Picks `if_true` or `if_false` when the step runs.
pub fn when(
    predicate: impl Fn(&Context) -> bool + Send + Sync + 'static,
    if_true: impl Step + 'static,
    if_false: impl Step + 'static,
) -> Conditional {
    Conditional {
        predicate: Arc::new(predicate),
        if_true: Arc::new(if_true),
        if_false: Arc::new(if_false),
    }
}

/// Builds a fan-out from `(step, context)` pairs.
///
/// A `None` context makes the branch share the parent's context.
pub fn parallel(
    branches: impl IntoIterator<Item = (StepRef, Option<Context>)>,
    join: impl Step + 'static,
) -> Action {
    let branches = branches
        .into_iter()
        .map(|(step, context)| Branch::from_ref(step, context))
        .collect();
    Action::fan_out(branches, join)
}

type StepFn = Arc<dyn Fn(&mut Context) -> Result<Action, WorkflowError> + Send + Sync>;

/// A named step backed by a synchronous closure.
#[derive(Clone)]
pub struct FnStep {
    name: StepName,
    f: StepFn,
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Step for FnStep {
    async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
        (self.f)(ctx)
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

/// Wraps a closure as a step.
pub fn from_fn(
    name: impl Into<StepName>,
    f: impl Fn(&mut Context) -> Result<Action, WorkflowError> + Send + Sync + 'static,
) -> FnStep {
    FnStep {
        name: name.into(),
        f: Arc::new(f),
    }
}

/// A step that finishes the workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct Finish;

#[async_trait]
impl Step for Finish {
    async fn execute(&self, _ctx: &mut Context) -> Result<Action, WorkflowError> {
        Ok(Action::Done)
    }

    fn name(&self) -> StepName {
        StepName::new("Done")
    }
}

/// A step that finishes the task immediately.
pub fn done() -> Finish {
    Finish
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> StepRef {
        let log = log.clone();
        Arc::new(from_fn(name, move |_ctx| {
            log.lock().unwrap().push(name.to_string());
            Ok(Action::Done)
        }))
    }

    /// Drives continuations inline, the way a single worker would.
    async fn drive(mut step: StepRef, ctx: &mut Context) -> Result<Action, WorkflowError> {
        loop {
            let action = step.execute(ctx).await?;
            match action {
                Action::Continue(next) => step = next,
                other => return Ok(other),
            }
        }
    }

    #[tokio::test]
    async fn test_sequence_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = sequence(vec![
            recorder(&log, "a"),
            recorder(&log, "b"),
            recorder(&log, "c"),
        ]);

        let mut ctx = Context::new();
        let last = drive(workflow, &mut ctx).await;
        assert!(matches!(last, Ok(Action::Done)));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_sequence_is_done() {
        let mut ctx = Context::new();
        let last = drive(sequence(Vec::new()), &mut ctx).await;
        assert!(matches!(last, Ok(Action::Done)));
    }

    #[tokio::test]
    async fn test_chain_stops_on_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = from_fn("Fail", |_ctx| Err(WorkflowError::step("Fail", "boom")));
        let workflow = Chain::new(Arc::new(failing), recorder(&log, "after"));

        let mut ctx = Context::new();
        let result = drive(Arc::new(workflow), &mut ctx).await;
        assert!(result.is_err());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chain_follows_suspension() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let suspending = from_fn("Wait", |_ctx| Ok(Action::suspend(done(), |_| {})));
        let workflow = Chain::new(Arc::new(suspending), recorder(&log, "after"));

        let mut ctx = Context::new();
        let Ok(Action::Suspend(suspension)) = drive(Arc::new(workflow), &mut ctx).await else {
            panic!("expected a suspension");
        };

        let (next, _register, _) = suspension.into_parts();
        let last = drive(next, &mut ctx).await;
        assert!(matches!(last, Ok(Action::Done)));
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_when_selects_branch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = when(
            |ctx: &Context| ctx.contains_key("exists"),
            recorder(&log, "patch"),
            recorder(&log, "create"),
        );

        let mut ctx = Context::new();
        drive(Arc::new(step.clone()), &mut ctx).await.unwrap();
        ctx.insert("exists", true);
        drive(Arc::new(step), &mut ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["create", "patch"]);
    }

    #[test]
    fn test_parallel_builds_fan_out() {
        let action = parallel(
            vec![
                (Arc::new(done()) as StepRef, None),
                (Arc::new(done()) as StepRef, Some(Context::new())),
            ],
            done(),
        );
        match action {
            Action::FanOut { branches, join } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(join.name(), "Done");
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }
}
