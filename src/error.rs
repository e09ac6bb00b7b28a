//! Error taxonomy for the orchestrator.
//!
//! Fatal errors abort a run before or during stage submission. Transient
//! scheduler failures during polling are absorbed by the orchestrator and
//! retried on the next poll interval. Element failures are not errors at all;
//! they surface as [`crate::pipeline::PollResult::failed_elements`].

use thiserror::Error;

/// Errors raised while partitioning work for a new run.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// The work source produced nothing to process.
    #[error("total work items must be > 0, got {total}")]
    NoWork {
        /// Requested amount of work.
        total: i64,
    },
    /// Node bounds are unusable.
    #[error("invalid partition bounds: {reason}")]
    InvalidBounds {
        /// Which bound was rejected.
        reason: String,
    },
    /// Shared storage could not be read or written.
    #[error("shared storage unreachable: {0}")]
    Storage(#[from] object_store::Error),
    /// The work source itself failed.
    #[error("work source failed: {reason}")]
    Source {
        /// Description of the failure.
        reason: String,
    },
    /// The partition manifest could not be encoded.
    #[error("partition manifest encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors returned by a [`crate::scheduler::JobScheduler`] backend.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler refused the request (capacity, config, bad request).
    #[error("scheduler rejected request: {reason}")]
    Rejected {
        /// Text returned by the scheduler.
        reason: String,
    },
    /// The scheduler could not be reached or failed internally.
    #[error("scheduler unavailable: {reason}")]
    Unavailable {
        /// Description of the backend failure.
        reason: String,
    },
    /// The scheduler has no record of a job.
    #[error("unknown job: {job_id}")]
    UnknownJob {
        /// Job id the scheduler did not recognize.
        job_id: String,
    },
}

impl SchedulerError {
    pub(crate) fn rejected<S: Into<String>>(reason: S) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable<S: Into<String>>(reason: S) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the orchestrator and its components.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Initialization failed; no stage was submitted.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// A submission was malformed and never reached the scheduler.
    #[error("invalid submission for stage {stage}: {reason}")]
    InvalidSubmission {
        /// Stage ordinal (1-based).
        stage: usize,
        /// What was wrong with the submission.
        reason: String,
    },

    /// The scheduler refused a stage submission.
    #[error("stage {stage} submission rejected: {source}")]
    SubmissionRejected {
        /// Stage ordinal (1-based).
        stage: usize,
        /// Scheduler response.
        #[source]
        source: SchedulerError,
    },

    /// A poll could not complete; retried on the next interval.
    #[error("poll failed: {0}")]
    Poll(#[source] SchedulerError),

    /// Run state could not be read from or written to shared storage.
    #[error("run state storage error: {0}")]
    Storage(#[from] object_store::Error),

    /// A run record could not be encoded or decoded.
    #[error("run state encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    /// No persisted record exists for the run.
    #[error("run {run_id} not found")]
    RunNotFound {
        /// Run that was looked up.
        run_id: String,
    },
}

impl OrchestratorError {
    pub(crate) fn invalid_submission<S: Into<String>>(stage: usize, reason: S) -> Self {
        Self::InvalidSubmission {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether the error aborts the run (as opposed to being retried).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Poll(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_errors_are_not_fatal() {
        let err = OrchestratorError::Poll(SchedulerError::unavailable("connection reset"));
        assert!(!err.is_fatal());

        let err = OrchestratorError::invalid_submission(2, "array size must be > 0");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::SubmissionRejected {
            stage: 3,
            source: SchedulerError::rejected("queue disabled"),
        };
        let display = err.to_string();
        assert!(display.contains("stage 3"));
        assert!(display.contains("queue disabled"));

        let err = PartitionError::NoWork { total: 0 };
        assert_eq!(err.to_string(), "total work items must be > 0, got 0");
    }
}
