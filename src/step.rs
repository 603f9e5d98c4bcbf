//! Step and sub-test traits for sequential workflows.
//!
//! A `Step` is one ordered unit of work. It reads and writes the shared
//! context and registers cleanup for every resource it acquires. Steps are
//! composed into programs using HList-based sequences.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::RunError;
use crate::execution::{ExecutionState, RunGuard, StepStatus};
use crate::teardown::Teardown;

/// A single unit of work in a program.
///
/// # Type Parameters
/// - `Ctx`: The context type shared across all steps
/// - `Err`: The error type for this step
#[async_trait::async_trait]
pub trait Step<Ctx, Err>: Send + Sync + 'static
where
    Ctx: Send + Sync,
    Err: Send + Sync,
{
    /// What the step needs besides the context.
    type Input: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Perform the step.
    ///
    /// Register a teardown action right after each resource is acquired, so
    /// a failure later in this step (or in any later step) still releases it.
    async fn execute(
        ctx: &mut Ctx,
        teardown: &mut Teardown<Ctx, Err>,
        input: &Self::Input,
    ) -> Result<(), Err>;
}

/// A check run after every step succeeded and before teardown.
#[async_trait::async_trait]
pub trait SubTest<Ctx, Err>: Send + Sync {
    /// Human-readable name used in logs and errors.
    fn title(&self) -> &str;

    /// Run the check.
    async fn run(&self, ctx: &mut Ctx) -> Result<(), Err>;
}

/// Wrapper for storing a named step and its input in an HList.
#[derive(Debug, Clone)]
pub struct StepWrapper<S: Step<Ctx, Err>, Ctx, Err>
where
    Ctx: Send + Sync,
    Err: Send + Sync,
{
    name: &'static str,
    input: S::Input,
    _marker: std::marker::PhantomData<fn() -> (S, Ctx, Err)>,
}

impl<S, Ctx, Err> StepWrapper<S, Ctx, Err>
where
    S: Step<Ctx, Err>,
    Ctx: Send + Sync,
    Err: Send + Sync + std::fmt::Display,
{
    /// Create a new step wrapper with the given name and input.
    pub fn new(name: &'static str, input: S::Input) -> Self {
        Self {
            name,
            input,
            _marker: std::marker::PhantomData,
        }
    }

    /// The declared step name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get a reference to the input.
    pub fn input(&self) -> &S::Input {
        &self.input
    }

    /// Execute the step at the current position, honouring the run guard.
    pub(crate) async fn run(
        &self,
        ctx: &mut Ctx,
        teardown: &mut Teardown<Ctx, Err>,
        state: &mut ExecutionState,
        guard: &RunGuard,
    ) -> Result<(), RunError<Err>> {
        let index = state.current_index();
        state.begin_step(index, self.name);

        tracing::info!(step = index, name = self.name, "step.start");

        match guard.run(S::execute(ctx, teardown, &self.input)).await {
            Ok(Ok(())) => {
                state.record_step_end(StepStatus::Succeeded);
                tracing::info!(step = index, name = self.name, outcome = "ok", "step.end");
                state.advance();
                Ok(())
            }
            Ok(Err(error)) => {
                state.record_step_end(StepStatus::Failed);
                tracing::error!(
                    step = index,
                    name = self.name,
                    error = %error,
                    "step.end"
                );
                Err(RunError::Step {
                    index,
                    name: self.name,
                    error,
                })
            }
            Err(interruption) => {
                state.record_step_end(StepStatus::Interrupted);
                tracing::error!(
                    step = index,
                    name = self.name,
                    reason = %interruption,
                    "step.interrupted"
                );
                Err(interruption.into_step_error(index, self.name))
            }
        }
    }
}
