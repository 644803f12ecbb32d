//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use spindle_core::WorkflowError;

/// Settings for a [`Scheduler`](crate::Scheduler).
///
/// ```
/// use spindle::SchedulerConfig;
/// use std::time::Duration;
///
/// let config = SchedulerConfig::default()
///     .with_workers(8)
///     .with_suspend_timeout(Duration::from_secs(120));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Name attached to the scheduler's log lines.
    pub name: String,
    /// Number of worker tasks pulling from the run queue.
    pub workers: usize,
    /// Applied to suspensions that don't carry their own timeout.
    /// `None` waits for the resumer indefinitely.
    pub suspend_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "spindle".to_string(),
            workers: 4,
            suspend_timeout: None,
        }
    }
}

impl SchedulerConfig {
    /// Sets the name used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the number of worker tasks.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the timeout applied to suspensions that don't carry their own.
    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = Some(timeout);
        self
    }

    /// Checks the configuration before any worker is spawned.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.workers == 0 {
            return Err(WorkflowError::Configuration(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.suspend_timeout == Some(Duration::ZERO) {
            return Err(WorkflowError::Configuration(
                "suspend_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
