//! Run-level errors reported by the executor.

use std::any::Any;

/// The primary failure of a run.
///
/// Exactly one of these is reported per failed run: the first step (or
/// sub-test) that did not succeed. Teardown problems never replace it; they
/// are collected in the run's [`TeardownReport`](crate::TeardownReport).
#[derive(thiserror::Error, Debug)]
pub enum RunError<E> {
    /// A step returned an error.
    #[error("step {index} ({name}) failed: {error}")]
    Step {
        /// Position of the step in the program.
        index: usize,
        /// Declared name of the step.
        name: &'static str,
        /// The step's error.
        error: E,
    },

    /// A step panicked.
    #[error("step {index} ({name}) panicked: {message}")]
    Panicked {
        /// Position of the step in the program.
        index: usize,
        /// Declared name of the step.
        name: &'static str,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The run was cancelled while the step was pending or in flight.
    #[error("run cancelled during step {index} ({name})")]
    Cancelled {
        /// Position of the interrupted step.
        index: usize,
        /// Declared name of the interrupted step.
        name: &'static str,
    },

    /// The run deadline passed while the step was pending or in flight.
    #[error("run deadline exceeded during step {index} ({name})")]
    DeadlineExceeded {
        /// Position of the interrupted step.
        index: usize,
        /// Declared name of the interrupted step.
        name: &'static str,
    },

    /// A sub-test failed after every step succeeded.
    #[error("sub-test '{title}' failed: {error}")]
    SubTest {
        /// Title of the sub-test.
        title: String,
        /// The sub-test's error.
        error: E,
    },

    /// A sub-test was interrupted (panic, cancellation or deadline).
    #[error("sub-test '{title}' interrupted: {reason}")]
    SubTestInterrupted {
        /// Title of the sub-test.
        title: String,
        /// What stopped it.
        reason: String,
    },
}

impl<E> RunError<E> {
    /// The error returned by a step or sub-test, if that is what failed.
    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Step { error, .. } | Self::SubTest { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Index of the step that failed, if the failure happened in a step.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::Step { index, .. }
            | Self::Panicked { index, .. }
            | Self::Cancelled { index, .. }
            | Self::DeadlineExceeded { index, .. } => Some(*index),
            Self::SubTest { .. } | Self::SubTestInterrupted { .. } => None,
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
