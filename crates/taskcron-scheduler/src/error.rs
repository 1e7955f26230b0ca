use thiserror::Error;

use crate::types::FailureReason;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad input, rejected before anything is persisted.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The recurrence expression does not parse or can never fire.
    #[error("Invalid recurrence '{expression}': {reason}")]
    InvalidRecurrence { expression: String, reason: String },

    /// Create-if-absent hit an existing id, or a guarded update lost a race.
    #[error("Conflict on task {id}: {reason}")]
    Conflict { id: String, reason: String },

    /// No (live) task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// Underlying storage failure. Never retried by the store itself.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An execution attempt failed.
    #[error("Dispatch failed: {0}")]
    Dispatch(FailureReason),
}

impl SchedulerError {
    /// Stable error kind reported to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "ValidationError",
            SchedulerError::InvalidRecurrence { .. } => "InvalidRecurrenceError",
            SchedulerError::Conflict { .. } => "ConflictError",
            SchedulerError::TaskNotFound { .. } => "NotFoundError",
            SchedulerError::Storage(_) => "StorageError",
            SchedulerError::Dispatch(_) => "DispatchFailure",
        }
    }

    /// True for bad-input errors (including recurrence parse failures).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::Validation(_) | SchedulerError::InvalidRecurrence { .. }
        )
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
