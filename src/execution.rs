//! Execution state types with typestate pattern.
//!
//! An [`Execution`] owns the program, the context and the teardown registry
//! of one run. `start()` drives the steps in order, runs sub-tests when every
//! step succeeded, and always drains the teardown registry before returning.
//! Invalid transitions (like starting a finished run) are caught at compile
//! time.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{panic_message, RunError};
use crate::hlist::InstructionList;
use crate::step::SubTest;
use crate::teardown::{Teardown, TeardownReport};

/// Get the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Unique identifier for a run, attached to its tracing span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Create a new random execution ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Typestate Markers
// ============================================================================

/// Marker: Execution has not started yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct New;

/// Marker: Every step and sub-test succeeded; teardown has run.
#[derive(Debug, Clone, Copy)]
pub struct Completed;

/// Marker: A step or sub-test failed; teardown has run.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

// ============================================================================
// Run Phase (Runtime)
// ============================================================================

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunPhase {
    /// Not started.
    #[default]
    Pending,
    /// Executing the step at this index.
    Running(usize),
    /// Every step succeeded.
    Succeeded,
    /// The step at this index failed.
    Failed(usize),
    /// Draining the teardown registry.
    TearingDown,
    /// Finished; every teardown action completed.
    Completed,
    /// Finished; at least one teardown action did not complete. The run's
    /// outcome is unchanged by this.
    CompletedWithTeardownErrors,
}

impl RunPhase {
    /// Returns `true` for the two terminal phases.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithTeardownErrors)
    }
}

// ============================================================================
// Step Timing
// ============================================================================

/// Outcome of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Step returned `Ok`.
    Succeeded,
    /// Step returned an error.
    Failed,
    /// Step was cancelled, hit the run deadline, or panicked.
    Interrupted,
}

/// Timing information for a single step execution.
#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    /// Index of the step.
    pub step_index: usize,
    /// Declared name of the step.
    pub name: &'static str,
    /// When the step started (Unix timestamp ms).
    pub started_at: u64,
    /// When the step completed (Unix timestamp ms), if completed.
    pub completed_at: Option<u64>,
    /// Outcome of the step, if completed.
    pub outcome: Option<StepStatus>,
}

impl StepTiming {
    /// Create a new step timing record.
    pub fn new(step_index: usize, name: &'static str) -> Self {
        Self {
            step_index,
            name,
            started_at: now_millis(),
            completed_at: None,
            outcome: None,
        }
    }

    /// Mark the step as completed with the given outcome.
    pub fn complete(&mut self, outcome: StepStatus) {
        self.completed_at = Some(now_millis());
        self.outcome = Some(outcome);
    }

    /// Get the duration in milliseconds, if completed.
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| end.saturating_sub(self.started_at))
    }
}

// ============================================================================
// Execution State (Internal)
// ============================================================================

/// Tracks position, phase and timing during a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionState {
    /// Index of the next step to run.
    index: usize,
    /// Current lifecycle phase.
    phase: RunPhase,
    /// When the run started (Unix timestamp ms).
    started_at: Option<u64>,
    /// Timing records for each step that was started.
    step_timings: Vec<StepTiming>,
}

impl ExecutionState {
    /// Create a new execution state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current step index.
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Number of steps that completed successfully.
    pub fn completed_steps(&self) -> usize {
        self.index
    }

    /// Get the current phase.
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Get when the run started.
    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    /// Get all step timing records.
    pub fn step_timings(&self) -> &[StepTiming] {
        &self.step_timings
    }

    /// Get the timing for a specific step by index.
    pub fn timing_for_step(&self, step_index: usize) -> Option<&StepTiming> {
        self.step_timings
            .iter()
            .find(|t| t.step_index == step_index)
    }

    pub(crate) fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(now_millis());
        }
    }

    pub(crate) fn set_phase(&mut self, phase: RunPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "run.phase");
        self.phase = phase;
    }

    pub(crate) fn begin_step(&mut self, step_index: usize, name: &'static str) {
        self.set_phase(RunPhase::Running(step_index));
        self.step_timings.push(StepTiming::new(step_index, name));
    }

    pub(crate) fn record_step_end(&mut self, outcome: StepStatus) {
        if let Some(timing) = self.step_timings.last_mut() {
            timing.complete(outcome);
        }
    }

    pub(crate) fn advance(&mut self) {
        self.index += 1;
    }
}

// ============================================================================
// Run Guard
// ============================================================================

/// Why a guarded future stopped before producing its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Interruption {
    Cancelled,
    DeadlineExceeded,
    Panicked(String),
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::DeadlineExceeded => f.write_str("run deadline exceeded"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

impl Interruption {
    pub(crate) fn into_step_error<E>(self, index: usize, name: &'static str) -> RunError<E> {
        match self {
            Self::Cancelled => RunError::Cancelled { index, name },
            Self::DeadlineExceeded => RunError::DeadlineExceeded { index, name },
            Self::Panicked(message) => RunError::Panicked {
                index,
                name,
                message,
            },
        }
    }
}

/// Cancellation token and deadline shared by every step of a run.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunGuard {
    /// Create a guard that fires on `cancel` or once `deadline` passes.
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    /// Returns `true` if the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` unless the run is cancelled, the deadline passes, or it
    /// panics. An interrupted future is dropped.
    pub(crate) async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interruption> {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interruption::Cancelled),
            _ = deadline => Err(Interruption::DeadlineExceeded),
            outcome = AssertUnwindSafe(fut).catch_unwind() => {
                outcome.map_err(|payload| Interruption::Panicked(panic_message(payload)))
            }
        }
    }
}

// ============================================================================
// Execution Result
// ============================================================================

/// Result of running an execution. Teardown has always run by the time this
/// is returned.
pub enum ExecutionResult<Ctx, Err, Steps>
where
    Steps: InstructionList<Ctx, Err>,
    Ctx: Send + Sync,
    Err: Send + Sync + fmt::Display,
{
    /// Every step and sub-test succeeded.
    Completed(Execution<Ctx, Err, Steps, Completed>),
    /// The first failure of the run.
    Failed(Execution<Ctx, Err, Steps, Failed>, RunError<Err>),
}

impl<Ctx, Err, Steps> ExecutionResult<Ctx, Err, Steps>
where
    Steps: InstructionList<Ctx, Err>,
    Ctx: Send + Sync,
    Err: Send + Sync + fmt::Display,
{
    /// Returns `true` if the run succeeded.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returns `true` if the run failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_, _))
    }

    /// Terminal phase of the run.
    pub fn phase(&self) -> RunPhase {
        match self {
            Self::Completed(e) => e.phase(),
            Self::Failed(e, _) => e.phase(),
        }
    }

    /// Teardown summary of the run.
    pub fn teardown_report(&self) -> &TeardownReport<Err> {
        match self {
            Self::Completed(e) => e.teardown_report(),
            Self::Failed(e, _) => e.teardown_report(),
        }
    }

    /// Discard the execution and keep only the outcome.
    pub fn into_result(self) -> Result<TeardownReport<Err>, RunError<Err>> {
        match self {
            Self::Completed(e) => Ok(e.report),
            Self::Failed(_, error) => Err(error),
        }
    }
}

// ============================================================================
// Execution (Typestate)
// ============================================================================

/// A workflow run with compile-time state tracking.
///
/// The `State` type parameter enforces valid operations:
/// - `Execution<..., New>`: Can be configured and `start()`ed
/// - `Execution<..., Completed>`: Can access final context and teardown report
/// - `Execution<..., Failed>`: Can access context and teardown report
pub struct Execution<Ctx, Err, Steps, State = New>
where
    Steps: InstructionList<Ctx, Err>,
    Ctx: Send + Sync,
    Err: Send + Sync + fmt::Display,
{
    id: ExecutionId,
    steps: Steps,
    ctx: Ctx,
    teardown: Teardown<Ctx, Err>,
    subtests: Vec<Box<dyn SubTest<Ctx, Err>>>,
    cancel: CancellationToken,
    deadline: Option<Duration>,
    state: ExecutionState,
    report: TeardownReport<Err>,
    _marker: PhantomData<State>,
}

impl<Ctx, Err, Steps> Execution<Ctx, Err, Steps, New>
where
    Steps: InstructionList<Ctx, Err>,
    Ctx: Send + Sync,
    Err: Send + Sync + fmt::Display,
{
    /// Create a new execution in the `New` state.
    pub fn new(steps: Steps, ctx: Ctx) -> Self {
        Self {
            id: ExecutionId::new(),
            steps,
            ctx,
            teardown: Teardown::new(),
            subtests: Vec::new(),
            cancel: CancellationToken::new(),
            deadline: None,
            state: ExecutionState::new(),
            report: TeardownReport::default(),
            _marker: PhantomData,
        }
    }

    /// Abort the run (and still tear down) when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Abort the run (and still tear down) once `limit` has elapsed since
    /// `start()`.
    pub fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    /// Abandon teardown actions that run longer than `limit`.
    pub fn with_teardown_timeout(mut self, limit: Duration) -> Self {
        self.teardown = std::mem::take(&mut self.teardown).with_action_timeout(limit);
        self
    }

    /// Run `subtest` after every step succeeded. Sub-tests run in the order
    /// they are added.
    pub fn with_subtest(mut self, subtest: impl SubTest<Ctx, Err> + 'static) -> Self {
        self.subtests.push(Box::new(subtest));
        self
    }

    /// The teardown registry, for resources acquired before the run starts.
    pub fn teardown_mut(&mut self) -> &mut Teardown<Ctx, Err> {
        &mut self.teardown
    }

    /// Get a reference to the context.
    pub fn context(&self) -> &Ctx {
        &self.ctx
    }

    /// Start execution.
    ///
    /// Runs the steps in order until one fails, then sub-tests, then drains
    /// the teardown registry regardless of the outcome.
    pub async fn start(self) -> ExecutionResult<Ctx, Err, Steps> {
        let span = tracing::info_span!("run", run_id = %self.id, steps = Steps::LEN);
        self.run_internal().instrument(span).await
    }
}

impl<Ctx, Err, Steps> Execution<Ctx, Err, Steps, Completed>
where
    Steps: InstructionList<Ctx, Err>,
    Ctx: Send + Sync,
    Err: Send + Sync + fmt::Display,
{
    /// Get a reference to the final context.
    pub fn context(&self) -> &Ctx {
        &self.ctx
    }

    /// Consume the execution and return the final context.
    pub fn into_context(self) -> Ctx {
        self.ctx
    }
}

impl<Ctx, Err, Steps> Execution<Ctx, Err, Steps, Failed>
where
    Steps: InstructionList<Ctx, Err>,
    Ctx: Send + Sync,
    Err: Send + Sync + fmt::Display,
{
    /// Get a reference to the context (for inspection).
    pub fn context(&self) -> &Ctx {
        &self.ctx
    }

    /// Consume the execution and return the context.
    pub fn into_context(self) -> Ctx {
        self.ctx
    }
}

impl<Ctx, Err, Steps, State> Execution<Ctx, Err, Steps, State>
where
    Steps: InstructionList<Ctx, Err>,
    Ctx: Send + Sync,
    Err: Send + Sync + fmt::Display,
{
    /// Identifier of this run.
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> RunPhase {
        self.state.phase()
    }

    /// Position and timing information.
    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Summary of the teardown drain (empty before the run finishes).
    pub fn teardown_report(&self) -> &TeardownReport<Err> {
        &self.report
    }

    async fn run_internal(mut self) -> ExecutionResult<Ctx, Err, Steps> {
        let guard = RunGuard::new(
            self.cancel.clone(),
            self.deadline.map(|limit| Instant::now() + limit),
        );
        self.state.mark_started();

        let outcome = match self
            .steps
            .execute_all(&mut self.ctx, &mut self.teardown, &mut self.state, &guard)
            .await
        {
            Ok(()) => {
                self.state.set_phase(RunPhase::Succeeded);
                self.run_subtests(&guard).await
            }
            Err(error) => {
                if let Some(index) = error.step_index() {
                    self.state.set_phase(RunPhase::Failed(index));
                }
                Err(error)
            }
        };

        self.state.set_phase(RunPhase::TearingDown);
        tracing::info!(pending = self.teardown.len(), "teardown.drain");
        self.report = self.teardown.drain(&mut self.ctx).await;

        if self.report.is_clean() {
            self.state.set_phase(RunPhase::Completed);
        } else {
            tracing::warn!(
                failed = self.report.failures.len(),
                executed = self.report.executed,
                "teardown finished with errors"
            );
            self.state.set_phase(RunPhase::CompletedWithTeardownErrors);
        }

        match outcome {
            Ok(()) => {
                tracing::info!("run.completed");
                ExecutionResult::Completed(self.transition())
            }
            Err(error) => {
                tracing::error!(error = %error, "run.failed");
                ExecutionResult::Failed(self.transition(), error)
            }
        }
    }

    async fn run_subtests(&mut self, guard: &RunGuard) -> Result<(), RunError<Err>> {
        for subtest in &self.subtests {
            let title = subtest.title().to_owned();
            tracing::info!(title = title.as_str(), "subtest.start");

            match guard.run(subtest.run(&mut self.ctx)).await {
                Ok(Ok(())) => {
                    tracing::info!(title = title.as_str(), outcome = "ok", "subtest.end");
                }
                Ok(Err(error)) => {
                    tracing::error!(title = title.as_str(), error = %error, "subtest.end");
                    return Err(RunError::SubTest { title, error });
                }
                Err(interruption) => {
                    tracing::error!(
                        title = title.as_str(),
                        reason = %interruption,
                        "subtest.interrupted"
                    );
                    return Err(RunError::SubTestInterrupted {
                        title,
                        reason: interruption.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn transition<Next>(self) -> Execution<Ctx, Err, Steps, Next> {
        Execution {
            id: self.id,
            steps: self.steps,
            ctx: self.ctx,
            teardown: self.teardown,
            subtests: self.subtests,
            cancel: self.cancel,
            deadline: self.deadline,
            state: self.state,
            report: self.report,
            _marker: PhantomData,
        }
    }
}
