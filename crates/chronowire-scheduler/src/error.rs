use chronowire_core::ChronowireError;
use thiserror::Error;

use crate::types::JobState;

/// Errors that can occur within the scheduler subsystem.
///
/// Losing a claim race is not an error: [`crate::store::JobStore::try_claim`]
/// simply returns `false` and the loser skips the job.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The provided schedule could not be parsed or does not fit the chronology.
    /// The job is never persisted.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No handler is registered under the job's type name at execution time.
    #[error("Handler not found for job type: {type_name}")]
    HandlerNotFound { type_name: String },

    /// The handler returned an error, panicked, or timed out.
    #[error("Handler failed: {0}")]
    HandlerExecution(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// Only jobs that are not in flight can be canceled.
    #[error("Job {id} cannot be canceled while {state}")]
    NotCancelable { id: String, state: JobState },

    /// The job store could not be reached or rejected the operation.
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::StoreUnavailable(e.to_string())
    }
}

impl From<SchedulerError> for ChronowireError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidSchedule(msg) => ChronowireError::InvalidSchedule(msg),
            SchedulerError::JobNotFound { id } => ChronowireError::JobNotFound { id },
            SchedulerError::NotCancelable { id, state } => ChronowireError::NotCancelable {
                id,
                state: state.to_string(),
            },
            SchedulerError::StoreUnavailable(msg) => ChronowireError::StoreUnavailable(msg),
            SchedulerError::Serialization(e) => ChronowireError::Serialization(e),
            other => ChronowireError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
