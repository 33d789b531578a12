//! Error types for recurq operations.
//!
//! Defines the error taxonomy shared by the subsystems:
//! - Store and job-state errors (`QueueError`)
//! - Job scheduler configuration and collision errors (`SchedulerError`)

use thiserror::Error;

/// Errors raised by the store and by job state transitions.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction aborted by concurrent writers after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Job {job_id} is not in the active state (state: {state})")]
    NotActive { job_id: String, state: String },

    #[error("Missing lock for job {job_id}")]
    LockMismatch { job_id: String },

    #[error("Job {0} is locked by a worker and cannot be removed")]
    JobLocked(String),

    #[error(
        "Job {job_id} belongs to job scheduler {scheduler_id} and cannot be removed directly; remove the job scheduler instead"
    )]
    JobBelongsToScheduler { job_id: String, scheduler_id: String },
}

impl QueueError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_)
            | QueueError::Unavailable(_)
            | QueueError::Contention { .. } => true,
            QueueError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
            }
            _ => false,
        }
    }
}

/// Errors raised while creating, advancing or removing job schedulers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Both .pattern and .every options are defined for this repeatable job")]
    PatternAndEvery,

    #[error("Either .pattern or .every options must be defined for this repeatable job")]
    MissingPatternOrEvery,

    #[error("Both .immediately and .startDate options are defined for this repeatable job")]
    ImmediatelyAndStartDate,

    #[error("End date must be greater than current timestamp")]
    EndDateInPast,

    #[error("Option .every must be greater than zero")]
    ZeroEvery,

    #[error("Invalid cron pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid timezone '{0}'")]
    InvalidTimezone(String),

    #[error("Repeat strategy failed for job '{name}': {reason}")]
    Strategy { name: String, reason: String },

    #[error("Cannot create job scheduler iteration - job ID already exists: {job_id}")]
    JobIdCollision { job_id: String },

    #[error(
        "Cannot create job scheduler iteration - current and next time slots already have jobs (scheduler {scheduler_id})"
    )]
    SlotsBusy { scheduler_id: String },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SchedulerError {
    /// Configuration errors are rejected before any storage is touched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SchedulerError::PatternAndEvery
                | SchedulerError::MissingPatternOrEvery
                | SchedulerError::ImmediatelyAndStartDate
                | SchedulerError::EndDateInPast
                | SchedulerError::ZeroEvery
                | SchedulerError::InvalidPattern { .. }
                | SchedulerError::InvalidTimezone(_)
        )
    }

    /// Collisions and transient store failures may succeed after a short delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::JobIdCollision { .. } | SchedulerError::SlotsBusy { .. } => true,
            SchedulerError::Queue(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_not_retryable() {
        for err in [
            SchedulerError::PatternAndEvery,
            SchedulerError::MissingPatternOrEvery,
            SchedulerError::ImmediatelyAndStartDate,
            SchedulerError::EndDateInPast,
        ] {
            assert!(err.is_configuration());
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_collisions_are_retryable() {
        let err = SchedulerError::JobIdCollision {
            job_id: "repeat:s:1".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("repeat:s:1"));

        let err = SchedulerError::SlotsBusy {
            scheduler_id: "s".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("time slots"));
    }

    #[test]
    fn test_removal_guard_names_job_and_scheduler() {
        let err = QueueError::JobBelongsToScheduler {
            job_id: "repeat:daily:1000".to_string(),
            scheduler_id: "daily".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("repeat:daily:1000"));
        assert!(message.contains("daily"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_store_errors_transient() {
        assert!(QueueError::Unavailable("down".to_string()).is_transient());
        assert!(QueueError::Contention { attempts: 3 }.is_transient());
        assert!(SchedulerError::from(QueueError::Unavailable("x".to_string())).is_retryable());
        assert!(!QueueError::JobNotFound("j".to_string()).is_transient());
    }
}
