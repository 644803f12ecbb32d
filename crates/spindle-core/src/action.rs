//! Engine directives returned by steps.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::combinator::Chain;
use crate::context::Context;
use crate::resume::Resumer;
use crate::step::{Step, StepRef};

/// What the engine does after a step runs.
pub enum Action {
    /// Run `next` immediately with the same context.
    Continue(StepRef),
    /// Park the task until the suspension's [`Resumer`] is used.
    Suspend(Suspension),
    /// Run `step` again no earlier than `after` from now.
    Retry {
        after: Duration,
        step: StepRef,
    },
    /// Run every branch as its own task, then `join` on this task's context.
    FanOut {
        branches: Vec<Branch>,
        join: StepRef,
    },
    /// The workflow finished successfully.
    Done,
}

impl Action {
    /// Continue with `step`.
    pub fn next(step: impl Step + 'static) -> Self {
        Action::Continue(Arc::new(step))
    }

    /// Retry `step` after `after`.
    pub fn retry(after: Duration, step: impl Step + 'static) -> Self {
        Action::Retry {
            after,
            step: Arc::new(step),
        }
    }

    /// Suspend, continuing at `next` once resumed.
    ///
    /// `register` is called after the task is parked, with the handle that
    /// must be used exactly once to resume it.
    pub fn suspend(
        next: impl Step + 'static,
        register: impl FnOnce(Resumer) + Send + 'static,
    ) -> Self {
        Action::Suspend(Suspension::new(next, register))
    }

    /// Fan out `branches`, then run `join`.
    pub fn fan_out(branches: Vec<Branch>, join: impl Step + 'static) -> Self {
        Action::FanOut {
            branches,
            join: Arc::new(join),
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Continue(_) => "continue",
            Action::Suspend(_) => "suspend",
            Action::Retry { .. } => "retry",
            Action::FanOut { .. } => "fan_out",
            Action::Done => "done",
        }
    }

    /// Makes `successor` run after whatever this action leads to finishes.
    ///
    /// `Done` becomes `Continue(successor)`; every continuation the engine
    /// would run next is wrapped so the successor still follows it.
    pub fn then(self, successor: StepRef) -> Self {
        let link = |step: StepRef| -> StepRef { Arc::new(Chain::new(step, successor.clone())) };
        match self {
            Action::Done => Action::Continue(successor.clone()),
            Action::Continue(step) => Action::Continue(link(step)),
            Action::Retry { after, step } => Action::Retry {
                after,
                step: link(step),
            },
            Action::Suspend(mut suspension) => {
                suspension.next = link(suspension.next);
                Action::Suspend(suspension)
            }
            Action::FanOut { branches, join } => Action::FanOut {
                branches,
                join: link(join),
            },
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Continue(step) => f.debug_tuple("Continue").field(&step.name()).finish(),
            Action::Suspend(suspension) => f.debug_tuple("Suspend").field(suspension).finish(),
            Action::Retry { after, step } => f
                .debug_struct("Retry")
                .field("after", after)
                .field("step", &step.name())
                .finish(),
            Action::FanOut { branches, join } => f
                .debug_struct("FanOut")
                .field("branches", branches)
                .field("join", &join.name())
                .finish(),
            Action::Done => f.write_str("Done"),
        }
    }
}

type Register = Box<dyn FnOnce(Resumer) + Send>;

/// A request to park the task until an external callback resumes it.
pub struct Suspension {
    next: StepRef,
    register: Register,
    timeout: Option<Duration>,
}

impl Suspension {
    /// Creates a new suspension that continues at `next` once resumed.
    ///
    /// `register` receives the task's [`Resumer`] after the task is parked.
    pub fn new(next: impl Step + 'static, register: impl FnOnce(Resumer) + Send + 'static) -> Self {
        Self::from_ref(Arc::new(next), register)
    }

    /// Like [`Suspension::new`], for a step that is already shared.
    pub fn from_ref(next: StepRef, register: impl FnOnce(Resumer) + Send + 'static) -> Self {
        Self {
            next,
            register: Box::new(register),
            timeout: None,
        }
    }

    /// Fail the task with `WorkflowError::Timeout` if not resumed in time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The step that runs once the task is resumed.
    pub fn next(&self) -> &StepRef {
        &self.next
    }

    /// Per-suspension timeout, overriding the scheduler default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Splits the suspension into its continuation, registration closure
    /// and timeout.
    pub fn into_parts(self) -> (StepRef, Register, Option<Duration>) {
        (self.next, self.register, self.timeout)
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("next", &self.next.name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// One child of a fan-out: a first step and the context it runs over.
#[derive(Debug)]
pub struct Branch {
    step: StepRef,
    context: Option<Context>,
}

impl Branch {
    /// A branch running over `context`, typically a [`Context::fork`] the
    /// caller has prepared.
    pub fn new(step: impl Step + 'static, context: Context) -> Self {
        Self {
            step: Arc::new(step),
            context: Some(context),
        }
    }

    /// A branch reading the parent's context.
    ///
    /// The child gets a fork taken when the fan-out starts, so it sees every
    /// parent value but its own writes stay local. The join step reads them
    /// from the branch's [`BranchOutcome`](crate::BranchOutcome), via
    /// `outcome.context()`.
    pub fn shared(step: impl Step + 'static) -> Self {
        Self {
            step: Arc::new(step),
            context: None,
        }
    }

    /// Like [`Branch::new`], for a step that is already shared.
    pub fn from_ref(step: StepRef, context: Option<Context>) -> Self {
        Self { step, context }
    }

    /// The branch's first step.
    pub fn step(&self) -> &StepRef {
        &self.step
    }

    /// `None` means the branch shares the parent's context.
    pub fn into_parts(self) -> (StepRef, Option<Context>) {
        (self.step, self.context)
    }
}
