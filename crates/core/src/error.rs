//! Queue error model.
//!
//! Only [`ExecutionError`] feeds the retry / failed-queue path. Every
//! [`QueueError`] variant is a caller bug or an infrastructure condition and is
//! handled outside the job lifecycle.

use thiserror::Error;

use crate::id::{JobId, ProcessId};

/// Result type used across the queue engine.
pub type QueueResult<T> = Result<T, QueueError>;

/// Record kind referenced by a [`QueueError::NotFound`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Missing {
    Job(JobId),
    Process(ProcessId),
}

impl core::fmt::Display for Missing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Missing::Job(id) => write!(f, "job {id}"),
            Missing::Process(id) => write!(f, "process {id}"),
        }
    }
}

/// Engine-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Bad arguments rejected synchronously; nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced job or process does not exist (or was already reaped).
    #[error("not found: {0}")]
    NotFound(Missing),

    /// The operation violates the job lifecycle.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Lock contention, busy database or timeout. Safe to retry with backoff.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Any other storage failure (constraint violation, corrupt row, closed pool).
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientStore(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn job_not_found(id: JobId) -> Self {
        Self::NotFound(Missing::Job(id))
    }

    pub fn process_not_found(id: ProcessId) -> Self {
        Self::NotFound(Missing::Process(id))
    }

    /// Whether the caller should retry the same operation after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::TransientStore(_))
    }
}

/// Failure raised by a job's own logic.
///
/// Recorded through `mark_failed` and subject to the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("job execution failed: {message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
