//! Core types for the spindle reconciliation engine.
//!
//! This crate has no runtime dependencies. Business code depends on it to
//! write steps; the `spindle` crate runs them.
//!
//! # Core Types
//!
//! - [`Step`] - A unit of workflow logic
//! - [`Action`] - What the engine does after a step (continue, suspend, retry, fan out, done)
//! - [`Context`] - Per-workflow key/value store shared between steps
//! - [`Resumer`] - The exactly-once handle that ends a suspension
//! - [`Outcome`] - How a task ended
//! - [`WorkflowError`] - Failures that end a task
//!
//! # Composition
//!
//! - [`chain`], [`sequence`] - Fixed successors
//! - [`when`] - Conditional successor
//! - [`parallel`] - Fan-out from `(step, context)` pairs
//! - [`from_fn`] - Closure steps
//! - [`RetryPolicy`] - Caller-side backoff producing `Retry` actions

mod action;
mod combinator;
mod context;
mod error;
mod outcome;
mod resume;
mod retry;
mod step;

pub use action::{Action, Branch, Suspension};
pub use combinator::{
    chain, done, from_fn, parallel, sequence, when, Chain, Conditional, Finish, FnStep,
};
pub use context::{Context, ContextKey, FAN_OUT_RESULTS};
pub use error::{ResumeError, WorkflowError};
pub use outcome::{BranchOutcome, Outcome};
pub use resume::{ResumeTarget, Resumer};
pub use retry::{RetryPolicy, RetryPolicyError};
pub use step::{step_ref, Step, StepName, StepRef};
