//! Caller-side backoff for transient failures.
//!
//! The engine only honours the delay carried by each `Action::Retry`; how that
//! delay grows and when to give up is decided here, inside business steps.

use std::time::Duration;

use crate::action::Action;
use crate::context::Context;
use crate::error::WorkflowError;
use crate::step::{StepName, StepRef};

/// Retry policy for transient step failures.
///
/// # Examples
///
/// ```
/// use spindle_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
///
/// // Delays: 100ms, 200ms, 400ms, ...
/// assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_millis(100)));
/// assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(400)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// No retry - fail immediately on error.
    #[default]
    None,
    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retry attempts.
        max_retries: u32,
        /// Delay between each retry.
        delay: Duration,
    },
    /// Exponential backoff with configurable parameters.
    ExponentialBackoff {
        /// Maximum number of retry attempts.
        max_retries: u32,
        /// Initial delay before first retry.
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
        /// Multiplier for each retry.
        multiplier: u32,
    },
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl std::fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

impl RetryPolicy {
    /// Creates a fixed retry policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy::Fixed { max_retries, delay }
    }

    /// Doubling backoff capped at 60 seconds.
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// Creates an exponential backoff retry policy with custom settings.
    pub fn exponential_backoff(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, RetryPolicyError> {
        if multiplier == 0 {
            return Err(RetryPolicyError("multiplier must be greater than 0"));
        }
        if max_delay < initial_delay {
            return Err(RetryPolicyError("max_delay must be >= initial_delay"));
        }
        Ok(RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        })
    }

    /// Returns the maximum number of retries for this policy.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { max_retries, .. } => *max_retries,
            RetryPolicy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { delay, .. } => Some(*delay),
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let factor = multiplier.saturating_pow(attempt);
                Some(initial_delay.saturating_mul(factor).min(*max_delay))
            }
        }
    }

    /// Schedules another attempt of `step`, counting attempts in `ctx`.
    ///
    /// Returns [`WorkflowError::RetriesExhausted`] once the policy's budget is
    /// spent. Call [`RetryPolicy::reset`] after the step succeeds if it may be
    /// retried again later in the same workflow.
    pub fn retry(&self, ctx: &mut Context, step: StepRef) -> Result<Action, WorkflowError> {
        let step_name = step.name();
        let key = attempts_key(&step_name);
        let attempts = ctx.get::<u32>(&key).copied().unwrap_or(0);

        match self.delay_for_attempt(attempts) {
            Some(after) if attempts < self.max_retries() => {
                ctx.insert(key, attempts + 1);
                Ok(Action::Retry { after, step })
            }
            _ => Err(WorkflowError::RetriesExhausted {
                step_name,
                attempts,
            }),
        }
    }

    /// Number of retries already scheduled for `step_name`.
    pub fn attempts(ctx: &Context, step_name: &StepName) -> u32 {
        ctx.get::<u32>(&attempts_key(step_name))
            .copied()
            .unwrap_or(0)
    }

    /// Clears the attempt counter for `step_name`.
    pub fn reset(ctx: &mut Context, step_name: &StepName) {
        ctx.remove::<u32>(&attempts_key(step_name));
    }
}

fn attempts_key(step_name: &StepName) -> String {
    format!("spindle.retry.{}", step_name)
}
