//! Error types for the remote execution coordinator.

use crate::types::OpId;
use thiserror::Error;

/// Coordination-level errors.
///
/// The enum is `Clone` because terminal operation states carry their error
/// over broadcast channels to every dependent and waiter; payloads are
/// therefore plain strings rather than wrapped source errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Internal: {0}")]
    Internal(String),

    #[error("Dependency failed: operation {op_id}: {reason}")]
    DependencyFailed { op_id: OpId, reason: String },
}

impl CoordinationError {
    /// Wrap this error as a dependency failure observed by `op_id`'s dependents.
    pub fn into_dependency_failure(self, op_id: OpId) -> CoordinationError {
        match self {
            // Propagated failures keep the original failing op as the subject.
            CoordinationError::DependencyFailed { .. } => self,
            other => CoordinationError::DependencyFailed {
                op_id,
                reason: other.to_string(),
            },
        }
    }
}

impl From<config::ConfigError> for CoordinationError {
    fn from(err: config::ConfigError) -> Self {
        CoordinationError::InvalidArgument(err.to_string())
    }
}
