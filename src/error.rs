//! Error taxonomy for the dossier workflow engine.

use thiserror::Error;

/// Failures raised by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },
    #[error("Transient store failure: {0}")]
    Transient(String),
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether an outer caller may retry the whole operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors surfaced by every engine operation.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("Precondition failed: {reason}")]
    PreconditionFailed { reason: String },
    #[error("Conflict: {reason}")]
    Conflict { reason: String },
    #[error(transparent)]
    Store(StoreError),
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        WorkflowError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        WorkflowError::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        WorkflowError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        WorkflowError::PreconditionFailed {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, WorkflowError::Store(e) if e.is_transient())
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation { constraint } => WorkflowError::Conflict {
                reason: format!("duplicate write rejected by {constraint}"),
            },
            other => WorkflowError::Store(other),
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
