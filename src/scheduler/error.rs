//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// No job with this id exists
    JobNotFound { id: String },

    /// A job with this name already exists
    DuplicateJob { name: String },

    /// Operator action not allowed in the job's current status
    InvalidJobState {
        id: String,
        status: String,
        operation: String,
    },

    /// Job definition rejected at creation time
    InvalidJob { field: String, reason: String },

    /// Stored job column could not be decoded
    SerializationError { reason: String },

    /// A worker task ended without producing a result
    WorkerJoin { job_id: String, reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobNotFound { id } => write!(f, "Job not found: {}", id),
            Self::DuplicateJob { name } => write!(f, "Job '{}' already exists", name),
            Self::InvalidJobState {
                id,
                status,
                operation,
            } => {
                write!(f, "Cannot {} job {} in status '{}'", operation, id, status)
            }
            Self::InvalidJob { field, reason } => {
                write!(f, "Invalid job definition in '{}': {}", field, reason)
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
            Self::WorkerJoin { job_id, reason } => {
                write!(f, "Worker for job {} did not complete: {}", job_id, reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create a job not found error
    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::JobNotFound { id: id.into() }
    }

    /// Create an invalid state error for an operator action
    pub fn invalid_state(
        id: impl Into<String>,
        status: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidJobState {
            id: id.into(),
            status: status.into(),
            operation: operation.into(),
        }
    }

    /// Create an invalid job definition error
    pub fn invalid_job(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidJob {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::WorkerJoin { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_error() {
        let err = SchedulerError::invalid_state("job-1", "completed", "cancel");
        assert_eq!(
            err.to_string(),
            "Cannot cancel job job-1 in status 'completed'"
        );
    }

    #[test]
    fn test_is_recoverable() {
        let join = SchedulerError::WorkerJoin {
            job_id: "job-1".to_string(),
            reason: "task cancelled".to_string(),
        };
        assert!(join.is_recoverable());
        assert!(!SchedulerError::job_not_found("job-1").is_recoverable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let scheduler_err: SchedulerError = json_err.into();
        assert!(matches!(
            scheduler_err,
            SchedulerError::SerializationError { .. }
        ));
    }
}
