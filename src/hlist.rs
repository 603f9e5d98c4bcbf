//! Heterogeneous list types for compile-time validated step sequences.
//!
//! HList (heterogeneous list) is used to enforce non-empty programs at compile
//! time: only `HSingle` and `HCons` implement `InstructionList`, so there is no
//! way to build an empty program.

use std::fmt;

use crate::error::RunError;
use crate::execution::{ExecutionState, RunGuard};
use crate::step::{Step, StepWrapper};
use crate::teardown::Teardown;

/// Non-empty heterogeneous list node.
///
/// `HCons<H, T>` holds a head element and a tail (which can be another HCons or HSingle).
#[derive(Debug, Clone)]
pub struct HCons<H, T> {
    /// The first element of this list segment.
    pub head: H,
    /// The remaining elements (another HCons or HSingle).
    pub tail: T,
}

impl<H, T> HCons<H, T> {
    /// Create a new HCons with the given head and tail.
    pub fn new(head: H, tail: T) -> Self {
        Self { head, tail }
    }
}

/// Single-element heterogeneous list (base case).
///
/// This is the minimal non-empty list.
#[derive(Debug, Clone)]
pub struct HSingle<H>(pub H);

impl<H> HSingle<H> {
    /// Create a new single-element list.
    pub fn new(head: H) -> Self {
        Self(head)
    }
}

/// Trait for step sequences that can be executed.
///
/// This trait is implemented for non-empty HLists (HSingle and HCons) only.
#[async_trait::async_trait]
pub trait InstructionList<Ctx, Err>: Send + Sync + 'static
where
    Ctx: Send + Sync,
    Err: Send + Sync,
{
    /// Number of steps in this list.
    const LEN: usize;

    /// Execute the steps in order, stopping at the first failure.
    ///
    /// Never drains the teardown registry; that is the caller's job.
    async fn execute_all(
        &self,
        ctx: &mut Ctx,
        teardown: &mut Teardown<Ctx, Err>,
        state: &mut ExecutionState,
        guard: &RunGuard,
    ) -> Result<(), RunError<Err>>;

    /// Declared step names, in execution order.
    fn names(&self) -> Vec<&'static str>;
}

/// Implementation for single-element list (base case).
#[async_trait::async_trait]
impl<S, Ctx, Err> InstructionList<Ctx, Err> for HSingle<StepWrapper<S, Ctx, Err>>
where
    S: Step<Ctx, Err>,
    Ctx: Send + Sync + 'static,
    Err: Send + Sync + fmt::Display + 'static,
{
    const LEN: usize = 1;

    async fn execute_all(
        &self,
        ctx: &mut Ctx,
        teardown: &mut Teardown<Ctx, Err>,
        state: &mut ExecutionState,
        guard: &RunGuard,
    ) -> Result<(), RunError<Err>> {
        self.0.run(ctx, teardown, state, guard).await
    }

    fn names(&self) -> Vec<&'static str> {
        vec![self.0.name()]
    }
}

/// Implementation for multi-element list (recursive case).
#[async_trait::async_trait]
impl<S, Ctx, Err, T> InstructionList<Ctx, Err> for HCons<StepWrapper<S, Ctx, Err>, T>
where
    S: Step<Ctx, Err>,
    Ctx: Send + Sync + 'static,
    Err: Send + Sync + fmt::Display + 'static,
    T: InstructionList<Ctx, Err>,
{
    const LEN: usize = 1 + T::LEN;

    async fn execute_all(
        &self,
        ctx: &mut Ctx,
        teardown: &mut Teardown<Ctx, Err>,
        state: &mut ExecutionState,
        guard: &RunGuard,
    ) -> Result<(), RunError<Err>> {
        // Head first; the tail only runs once the head has settled.
        self.head.run(ctx, teardown, state, guard).await?;
        self.tail.execute_all(ctx, teardown, state, guard).await
    }

    fn names(&self) -> Vec<&'static str> {
        let mut names = vec![self.head.name()];
        names.extend(self.tail.names());
        names
    }
}
