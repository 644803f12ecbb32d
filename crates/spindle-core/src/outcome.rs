//! Terminal results of a task.

use crate::context::Context;
use crate::error::WorkflowError;
use crate::step::StepName;

/// How a task ended. Handed to every completion callback.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A step returned `Action::Done`; carries the final context.
    Completed(Context),
    /// A step failed, panicked, or was resumed with an error.
    Failed(WorkflowError),
    /// Cancellation was requested and acknowledged at a step boundary.
    Cancelled,
}

impl Outcome {
    /// Returns true if the task completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// Returns true if the task failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Returns true if the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// The final context of a completed task.
    pub fn context(&self) -> Option<&Context> {
        match self {
            Outcome::Completed(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// The failure of a failed task.
    pub fn error(&self) -> Option<&WorkflowError> {
        match self {
            Outcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// The result of one fan-out child, as seen by the join step.
#[derive(Debug, Clone)]
pub struct BranchOutcome {
    /// Position of the branch in the original fan-out.
    pub index: usize,
    /// Name of the first step the branch ran.
    pub step_name: StepName,
    pub outcome: Outcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_accessors() {
        let completed = Outcome::Completed(Context::new());
        assert!(completed.is_completed());
        assert!(completed.context().is_some());
        assert!(completed.error().is_none());

        let failed = Outcome::Failed(WorkflowError::step("PatchPod", "conflict"));
        assert!(failed.is_failed());
        assert_eq!(
            failed.error().map(ToString::to_string),
            Some("Step failed: PatchPod, details: conflict".to_string())
        );

        assert!(Outcome::Cancelled.is_cancelled());
        assert!(Outcome::Cancelled.context().is_none());
    }
}
