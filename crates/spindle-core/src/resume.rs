//! The handle that ends a suspension.

use std::fmt;

use crate::context::Context;
use crate::error::{ResumeError, WorkflowError};

/// Engine-side receiver of a resume call.
///
/// Implemented by the runtime; step authors only see [`Resumer`].
pub trait ResumeTarget: Send {
    fn resume(self: Box<Self>, result: Result<Context, WorkflowError>) -> Result<(), ResumeError>;
}

/// Resumes one suspended task, exactly once.
///
/// Every resume method consumes the handle, so a suspension cannot be resumed
/// twice. Dropping the handle without resuming fails the task with
/// [`WorkflowError::Abandoned`].
pub struct Resumer {
    target: Box<dyn ResumeTarget>,
}

impl Resumer {
    /// Creates a new resumer reporting to `target`.
    pub fn new(target: impl ResumeTarget + 'static) -> Self {
        Self {
            target: Box::new(target),
        }
    }

    /// Resumes the task.
    ///
    /// `Ok(update)` merges `update` into the task's context and continues at
    /// the suspension's next step; `Err(error)` finishes the task as failed.
    pub fn resume(self, result: Result<Context, WorkflowError>) -> Result<(), ResumeError> {
        self.target.resume(result)
    }

    /// Resumes successfully with `update` merged into the task's context.
    pub fn complete(self, update: Context) -> Result<(), ResumeError> {
        self.resume(Ok(update))
    }

    /// Resumes successfully without changing the context.
    pub fn wake(self) -> Result<(), ResumeError> {
        self.resume(Ok(Context::new()))
    }

    /// Resumes with a failure.
    pub fn fail(self, error: WorkflowError) -> Result<(), ResumeError> {
        self.resume(Err(error))
    }
}

impl fmt::Debug for Resumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resumer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder(Arc<Mutex<Vec<Result<usize, WorkflowError>>>>);

    impl ResumeTarget for Recorder {
        fn resume(
            self: Box<Self>,
            result: Result<Context, WorkflowError>,
        ) -> Result<(), ResumeError> {
            self.0.lock().unwrap().push(result.map(|ctx| ctx.len()));
            Ok(())
        }
    }

    #[test]
    fn test_resumer_forwards_result() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut update = Context::new();
        update.insert("x", 1i32);
        Resumer::new(Recorder(seen.clone())).complete(update).unwrap();
        Resumer::new(Recorder(seen.clone())).wake().unwrap();
        Resumer::new(Recorder(seen.clone()))
            .fail(WorkflowError::step("ReadPod", "not found"))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Ok(1));
        assert_eq!(seen[1], Ok(0));
        assert!(seen[2].is_err());
    }
}
