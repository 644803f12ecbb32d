//! Step trait and step names.

use crate::action::Action;
use crate::context::Context;
use crate::error::WorkflowError;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a StepName from a type's name (last path segment, generics stripped).
    pub fn from_type_name<T: ?Sized>() -> Self {
        let full_name = std::any::type_name::<T>();
        let base = full_name.split('<').next().unwrap_or(full_name);
        let short_name = base.rsplit("::").next().unwrap_or("UnknownStep");
        Self::new(short_name)
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for StepName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A shared, immutable step value. Successors are passed around as these.
pub type StepRef = Arc<dyn Step>;

/// A unit of workflow logic.
///
/// A step reads and writes the task's [`Context`] and tells the engine what
/// to do next by returning an [`Action`]. Returning `Err` ends the task with
/// a failure; the engine never runs the same task's steps concurrently.
///
/// # Examples
///
/// ```
/// use spindle_core::{Action, Context, Step, WorkflowError};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct RecordGeneration;
///
/// #[async_trait]
/// impl Step for RecordGeneration {
///     async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
///         ctx.insert("generation", 7u64);
///         Ok(Action::Done)
///     }
/// }
///
/// assert_eq!(RecordGeneration.name().as_str(), "RecordGeneration");
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Executes the step logic.
    ///
    /// # Returns
    ///
    /// - `Ok(action)` - What the engine should do next
    /// - `Err(error)` - Fatal failure; the task finishes as failed
    async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError>;

    /// Returns the step name. Defaults to the type name.
    fn name(&self) -> StepName {
        StepName::from_type_name::<Self>()
    }
}

#[async_trait]
impl<S: Step + ?Sized> Step for Arc<S> {
    async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
        (**self).execute(ctx).await
    }

    fn name(&self) -> StepName {
        (**self).name()
    }
}

/// Wraps a step value into a [`StepRef`].
pub fn step_ref(step: impl Step + 'static) -> StepRef {
    Arc::new(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestStep;

    #[async_trait]
    impl Step for TestStep {
        async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
            ctx.insert("test", "executed".to_string());
            Ok(Action::Done)
        }
    }

    #[tokio::test]
    async fn test_step_execution() {
        let step = TestStep;
        let mut ctx = Context::new();

        let action = step.execute(&mut ctx).await;
        assert!(matches!(action, Ok(Action::Done)));
        assert_eq!(ctx.get::<String>("test").map(|s| s.as_str()), Some("executed"));
    }

    #[test]
    fn test_step_name() {
        let name = StepName::new("test");
        assert_eq!(name.as_str(), "test");

        let name: StepName = "test".into();
        assert_eq!(name, "test");

        assert_eq!(TestStep.name(), StepName::new("TestStep"));
    }

    #[test]
    fn test_shared_step_keeps_name() {
        let shared: StepRef = step_ref(TestStep);
        assert_eq!(shared.name(), "TestStep");
        assert_eq!(Arc::new(shared).name(), "TestStep");
    }

    #[test]
    fn test_type_name_strips_generics() {
        assert_eq!(StepName::from_type_name::<Vec<String>>(), "Vec");
    }
}
