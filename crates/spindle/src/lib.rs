//! A cooperative scheduler for multi-step reconciliation workflows.
//!
//! Business logic is written as [`Step`]s that return an [`Action`]: continue
//! with another step, suspend until an async callback resumes the task, retry
//! after a delay, fan out into child tasks, or finish. A [`Scheduler`] drives
//! tasks on a fixed pool of tokio workers, and a [`ResourceGate`] keeps at
//! most one task per resource key active.
//!
//! # Example
//!
//! ```rust,no_run
//! use spindle::prelude::*;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct ReadPod;
//!
//! #[async_trait]
//! impl Step for ReadPod {
//!     async fn execute(&self, _ctx: &mut Context) -> Result<Action, WorkflowError> {
//!         Ok(Action::suspend(done(), |resumer| {
//!             // hand `resumer` to the client callback
//!             let mut pod = Context::new();
//!             pod.insert("phase", "Running".to_string());
//!             let _ = resumer.complete(pod);
//!         }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkflowError> {
//!     let scheduler = Scheduler::new(SchedulerConfig::default())?;
//!     let gate = ResourceGate::new(scheduler.clone());
//!
//!     gate.admit_or_queue("default/web-0", Arc::new(ReadPod), Context::new(), |outcome| {
//!         tracing::info!("reconcile finished: {:?}", outcome);
//!     });
//!     Ok(())
//! }
//! ```

mod config;
mod gate;
mod scheduler;
mod task;
mod timer;

// Re-export core types
pub use spindle_core::*;

pub use config::SchedulerConfig;
pub use gate::{Admission, ResourceGate};
pub use scheduler::Scheduler;
pub use task::{OnDone, TaskHandle, TaskId, TaskState};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        chain, done, from_fn, parallel, sequence, step_ref, when, Action, Admission, Branch,
        BranchOutcome, Context, ContextKey, Outcome, ResourceGate, ResumeError, Resumer,
        RetryPolicy, Scheduler, SchedulerConfig, Step, StepName, StepRef, Suspension, TaskHandle,
        TaskId, TaskState, WorkflowError, FAN_OUT_RESULTS,
    };
}
