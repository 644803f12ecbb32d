//! Workflow error types.

use crate::step::StepName;
use thiserror::Error;

/// Errors that end a task with [`Outcome::Failed`](crate::Outcome::Failed).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step reported a fatal business failure.
    #[error("Step failed: {step_name}, details: {details}")]
    StepError {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// A suspension was not resumed before its timeout elapsed.
    #[error("Timeout occurred in step: {step_name}")]
    Timeout {
        /// The continuation step that was waiting.
        step_name: StepName,
    },

    /// The resume handle of a suspension was dropped without resuming.
    #[error("Suspension abandoned before resume in step: {step_name}")]
    Abandoned {
        /// The continuation step that was waiting.
        step_name: StepName,
    },

    /// A step panicked instead of returning an action.
    #[error("Step panicked: {step_name}, details: {details}")]
    Panicked {
        /// The name of the step that panicked.
        step_name: StepName,
        /// The panic payload, if it was a string.
        details: String,
    },

    /// A retry policy ran out of attempts.
    #[error("Retries exhausted in step '{step_name}' after {attempts} attempts")]
    RetriesExhausted {
        /// The step being retried.
        step_name: StepName,
        /// Retries already performed.
        attempts: u32,
    },

    /// The scheduler configuration is invalid.
    #[error("Invalid scheduler configuration: {0}")]
    Configuration(String),

    /// The scheduler stopped before the task could run.
    #[error("Scheduler has been shut down")]
    Shutdown,
}

impl WorkflowError {
    /// Shorthand for [`WorkflowError::StepError`].
    pub fn step(step_name: impl Into<StepName>, details: impl Into<String>) -> Self {
        WorkflowError::StepError {
            step_name: step_name.into(),
            details: details.into(),
        }
    }
}

/// Returned by [`Resumer::resume`](crate::Resumer::resume) when the
/// suspension it belongs to has already ended.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResumeError {
    /// The task was cancelled or timed out while suspended.
    #[error("task is no longer suspended")]
    NotSuspended,

    /// The scheduler no longer accepts work.
    #[error("scheduler has been shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorkflowError::step("test_step", "test error");
        assert_eq!(
            error.to_string(),
            "Step failed: test_step, details: test error"
        );

        let timeout = WorkflowError::Timeout {
            step_name: StepName::new("AwaitPodReady"),
        };
        assert_eq!(timeout.to_string(), "Timeout occurred in step: AwaitPodReady");

        let exhausted = WorkflowError::RetriesExhausted {
            step_name: StepName::new("ReplacePod"),
            attempts: 5,
        };
        assert_eq!(
            exhausted.to_string(),
            "Retries exhausted in step 'ReplacePod' after 5 attempts"
        );
    }

    #[test]
    fn test_resume_error_display() {
        assert_eq!(
            ResumeError::NotSuspended.to_string(),
            "task is no longer suspended"
        );
    }
}
