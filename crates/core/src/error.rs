//! Crate-level error type

use crate::config::ConfigError;
use crate::dispatch::DispatcherError;
use crate::execution::{ExecutionFailure, RegistryError};
use crate::job::{IllegalTransition, JobId};
use crate::lease::LeaseError;
use crate::persistence::StoreError;

/// Errors surfaced by the coordination core
///
/// Store and lease failures are transient and retried by the dispatch loop;
/// validation and illegal transitions are rejected and never retried.
#[derive(Debug, thiserror::Error)]
pub enum TaskFlowError {
    /// Rejected synchronously, not retried
    #[error("validation error: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Transient; retried by the control loop
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    /// Transient; retried by the control loop
    #[error("lease store unavailable: {0}")]
    LeaseUnavailable(String),

    /// Result discarded; the job is recovered through lease expiry
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),

    /// Another path moved the job before this result was committed
    #[error("job {0} was moved by another worker")]
    Superseded(JobId),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionFailure),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskFlowError {
    /// Whether the operation may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::LeaseUnavailable(_))
    }
}

impl From<StoreError> for TaskFlowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => Self::Validation(msg),
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Constraint(msg) | StoreError::Corrupt(msg) => Self::Internal(msg),
        }
    }
}

impl From<LeaseError> for TaskFlowError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Unavailable(msg) => Self::LeaseUnavailable(msg),
        }
    }
}
