//! Error types for the workflow runtime.

use std::fmt::Display;

/// Errors surfaced by aggregates and use cases.
///
/// `NotFound` and `InvalidState` are precondition failures and are never
/// retried. `External` wraps collaborator failures (agent process, git,
/// file system), which the pipeline driver treats as transient.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A run, stage, checkpoint or repository is absent.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// Wrong status for the requested transition, or mismatched ownership.
    #[error("invalid state: {message}")]
    InvalidState { message: String },
    /// Template or configuration value that cannot be frozen into a run.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
    /// Optimistic lock failure (concurrent modification detected).
    #[error("concurrency conflict: {message}")]
    ConcurrencyConflict { message: String },
    /// Storage/persistence failure.
    #[error("storage failure: {message}")]
    Storage { message: String },
    /// Failure reported by an external collaborator.
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Returns true if the target of the operation no longer exists.
    ///
    /// Also looks inside collaborator errors, which may carry an
    /// `EngineError::NotFound` through `anyhow`.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::External(err) => err
                .chain()
                .any(|cause| matches!(cause.downcast_ref::<EngineError>(), Some(e) if e.is_not_found())),
            _ => false,
        }
    }

    /// Returns true if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::External(_) | Self::Storage { .. }) && !self.is_not_found()
    }
}
