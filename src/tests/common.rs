//! Common types and step implementations for tests.
//!
//! This module contains:
//! - `RigContext`: The shared context, with an event log
//! - `RigError`: Error type for the rig steps
//! - Step implementations: `Acquire`, `Explode`, `Stall`
//! - Sub-test: `Check`
//! - Program definitions using the `workflow!` macro

use serde::{Deserialize, Serialize};

use crate::{workflow, Context, Step, SubTest, Teardown, TeardownAction};

// ============================================================================
// Error Type
// ============================================================================

/// Errors raised by the rig steps.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum RigError {
    /// A resource could not be acquired.
    #[error("could not acquire {0}")]
    Refused(String),

    /// A resource could not be released.
    #[error("could not release {0}")]
    Release(String),

    /// A sub-test failed.
    #[error("check {0} failed")]
    Check(String),
}

// ============================================================================
// Context Type
// ============================================================================

/// Shared state for rig programs.
#[derive(Default, Debug)]
pub struct RigContext {
    /// Deep-merged step output.
    pub state: Context,
    /// `run:<resource>`, `subtest:<title>` and `release:<resource>` entries,
    /// in the order they happened.
    pub events: Vec<String>,
}

impl RigContext {
    pub fn events(&self) -> Vec<&str> {
        self.events.iter().map(String::as_str).collect()
    }
}

// ============================================================================
// Step Implementations
// ============================================================================

/// Input for [`Acquire`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireInput {
    pub resource: String,
    pub fail: bool,
    pub fail_late: bool,
    pub fail_release: bool,
}

pub fn acquire(resource: &str) -> AcquireInput {
    AcquireInput {
        resource: resource.to_owned(),
        fail: false,
        fail_late: false,
        fail_release: false,
    }
}

impl AcquireInput {
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn failing_late(mut self) -> Self {
        self.fail_late = true;
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }
}

/// Claims a resource, marks it in the context and registers its release.
/// `fail` fails before anything is registered, `fail_late` right after.
pub struct Acquire;

#[async_trait::async_trait]
impl Step<RigContext, RigError> for Acquire {
    type Input = AcquireInput;

    async fn execute(
        ctx: &mut RigContext,
        teardown: &mut Teardown<RigContext, RigError>,
        input: &Self::Input,
    ) -> Result<(), RigError> {
        ctx.events.push(format!("run:{}", input.resource));
        if input.fail {
            return Err(RigError::Refused(input.resource.clone()));
        }

        ctx.state
            .set_at(&format!("resources.{}", input.resource), true);
        teardown.register(
            format!("release {}", input.resource),
            Release {
                resource: input.resource.clone(),
                fail: input.fail_release,
            },
        );
        if input.fail_late {
            return Err(RigError::Refused(input.resource.clone()));
        }
        Ok(())
    }
}

/// Releases a resource claimed by [`Acquire`].
pub struct Release {
    pub resource: String,
    pub fail: bool,
}

#[async_trait::async_trait]
impl TeardownAction<RigContext, RigError> for Release {
    async fn run(self: Box<Self>, ctx: &mut RigContext) -> Result<(), RigError> {
        ctx.events.push(format!("release:{}", self.resource));
        if self.fail {
            return Err(RigError::Release(self.resource));
        }
        Ok(())
    }
}

/// Panics.
pub struct Explode;

#[async_trait::async_trait]
impl Step<RigContext, RigError> for Explode {
    type Input = ();

    async fn execute(
        _ctx: &mut RigContext,
        _teardown: &mut Teardown<RigContext, RigError>,
        _input: &(),
    ) -> Result<(), RigError> {
        panic!("boom");
    }
}

/// Never finishes.
pub struct Stall;

#[async_trait::async_trait]
impl Step<RigContext, RigError> for Stall {
    type Input = ();

    async fn execute(
        ctx: &mut RigContext,
        _teardown: &mut Teardown<RigContext, RigError>,
        _input: &(),
    ) -> Result<(), RigError> {
        ctx.events.push("run:stall".to_owned());
        std::future::pending::<()>().await;
        Ok(())
    }
}

// ============================================================================
// Sub-tests
// ============================================================================

/// Sub-test that records itself and optionally fails.
pub struct Check {
    pub title: &'static str,
    pub fail: bool,
}

impl Check {
    pub fn passing(title: &'static str) -> Self {
        Self { title, fail: false }
    }

    pub fn failing(title: &'static str) -> Self {
        Self { title, fail: true }
    }
}

#[async_trait::async_trait]
impl SubTest<RigContext, RigError> for Check {
    fn title(&self) -> &str {
        self.title
    }

    async fn run(&self, ctx: &mut RigContext) -> Result<(), RigError> {
        ctx.events.push(format!("subtest:{}", self.title));
        if self.fail {
            return Err(RigError::Check(self.title.to_owned()));
        }
        Ok(())
    }
}

// ============================================================================
// Program Definitions
// ============================================================================

workflow! {
    Solo<RigContext, RigError> {
        only: Acquire,
    }
}

workflow! {
    Pair<RigContext, RigError> {
        first: Acquire,
        second: Acquire,
    }
}

workflow! {
    FiveSteps<RigContext, RigError> {
        one: Acquire,
        two: Acquire,
        three: Acquire,
        four: Acquire,
        five: Acquire,
    }
}

workflow! {
    WithPanic<RigContext, RigError> {
        first: Acquire,
        boom: Explode,
        after: Acquire,
    }
}

workflow! {
    WithStall<RigContext, RigError> {
        first: Acquire,
        stall: Stall,
        after: Acquire,
    }
}

pub fn five(failing_at: Option<usize>) -> FiveStepsInputs {
    let mut inputs = ["a", "b", "c", "d", "e"].map(acquire);
    if let Some(index) = failing_at {
        inputs[index] = inputs[index].clone().failing();
    }
    let [one, two, three, four, five] = inputs;
    FiveStepsInputs {
        one,
        two,
        three,
        four,
        five,
    }
}
