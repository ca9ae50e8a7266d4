use thiserror::Error;

use crate::job::{JobCategory, JobId, JobStatus};
use crate::queue::QueueError;

/// Errors surfaced by scheduler operations and the HTTP front door.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("{what} is already in progress (job {job_id})")]
    AlreadyInProgress { what: String, job_id: JobId },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unable to cancel {category} job {job_id}: {reason}")]
    UnableToCancel {
        category: JobCategory,
        job_id: JobId,
        reason: String,
    },

    #[error("job {job_id} is {status}, expected one of {expected:?}")]
    UnexpectedStatus {
        job_id: JobId,
        status: JobStatus,
        expected: Vec<JobStatus>,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WardenError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        WardenError::NotFound(what.to_string())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        WardenError::InvalidInput(message.into())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Internal(err.into())
    }
}

pub type Result<T, E = WardenError> = std::result::Result<T, E>;
