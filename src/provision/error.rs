//! Errors raised by the provisioning steps.

use crate::context::ContextError;
use crate::poll::PollError;

use super::services::ServiceError;

/// Why a provisioning step or sub-test failed.
#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    /// A collaborator call failed.
    #[error("{operation} failed: {source}")]
    Service {
        /// Collaborator operation, e.g. `cloud.create_application`.
        operation: &'static str,
        /// What the collaborator reported.
        #[source]
        source: ServiceError,
    },

    /// A wait did not see its condition hold.
    #[error("waiting for {condition}: {source}")]
    Wait {
        /// What was awaited.
        condition: &'static str,
        /// How the wait ended.
        #[source]
        source: PollError<ServiceError>,
    },

    /// A value the step needs was never written.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Local file handling failed.
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    /// The device is in an unexpected state.
    #[error("assertion failed: {0}")]
    Assertion(String),
}

impl ProvisionError {
    /// Returns `true` if the error is a wait that ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Wait { source, .. } if source.is_timeout())
    }
}

/// Attach the failing operation to a collaborator result.
pub(crate) trait ServiceResultExt<T> {
    fn during(self, operation: &'static str) -> Result<T, ProvisionError>;
}

impl<T> ServiceResultExt<T> for Result<T, ServiceError> {
    fn during(self, operation: &'static str) -> Result<T, ProvisionError> {
        self.map_err(|source| ProvisionError::Service { operation, source })
    }
}

/// Attach the awaited condition to a poll result.
pub(crate) trait WaitResultExt<T> {
    fn waiting_for(self, condition: &'static str) -> Result<T, ProvisionError>;
}

impl<T> WaitResultExt<T> for Result<T, PollError<ServiceError>> {
    fn waiting_for(self, condition: &'static str) -> Result<T, ProvisionError> {
        self.map_err(|source| ProvisionError::Wait { condition, source })
    }
}
