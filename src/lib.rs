#![deny(missing_docs)]

//! devrig: sequential provisioning workflows with guaranteed teardown.
//!
//! # Design Goals
//!
//! - **Ordered steps over explicit state**: every step receives the run
//!   context and teardown registry by reference; nothing is ambient
//! - **Teardown always runs**: cleanup registered by any step is drained in
//!   reverse order whether the run succeeds, fails, panics or is cancelled
//! - **Typed waiting**: eventually-consistent checks go through a poller that
//!   reports `Satisfied`, `TimedOut`, `Failed` or `Cancelled`
//!
//! # Core Concepts
//!
//! - [`Context`]: deep-merged JSON state shared by the steps of a run
//! - [`Teardown`]: LIFO registry of owned cleanup actions
//! - [`Poller`]: condition polling with interval, timeout and error policy
//! - [`Step`] and [`workflow!`]: non-empty, ordered programs
//! - [`Execution`]: one run, with typestate tracking (`New`, `Completed`, `Failed`)
//! - [`provision`]: the device provisioning suite built on the above
//!
// Re-export paste for macros
pub use paste;

// Modules
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod hlist;
pub mod logging;
mod macros;
pub mod poll;
pub mod provision;
pub mod step;
pub mod teardown;

// Re-exports for convenience
pub use context::{Context, ContextError};
pub use error::RunError;
pub use execution::{
    Completed, Execution, ExecutionId, ExecutionResult, ExecutionState, Failed, New, RunGuard,
    RunPhase, StepStatus, StepTiming,
};
pub use hlist::{HCons, HSingle, InstructionList};
pub use poll::{PollError, PollOptions, PollOutcome, Poller};
pub use step::{Step, StepWrapper, SubTest};
pub use teardown::{Teardown, TeardownAction, TeardownFailure, TeardownFault, TeardownReport};

#[cfg(test)]
mod tests;
