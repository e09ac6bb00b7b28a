//! The external array-job scheduler.
//!
//! The orchestrator never runs elements itself. It submits array jobs with
//! declarative dependency links and reads job status back; everything in
//! between belongs to the scheduler behind [`JobScheduler`].

mod http;
mod simulated;

pub use http::HttpScheduler;
pub use simulated::SimulatedScheduler;

use crate::error::SchedulerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of a job or of a single array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Whether no further transition can occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Pending => "PENDING",
            JobStatus::Runnable => "RUNNABLE",
            JobStatus::Starting => "STARTING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// How a dependent job waits on its upstream job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyType {
    /// The whole upstream job must succeed before any element starts.
    #[default]
    #[serde(rename = "JOB")]
    Job,
    /// Element i waits on element i of the upstream job.
    #[serde(rename = "N_TO_N")]
    NToN,
}

/// A declarative link to an upstream job, resolved by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    pub job_id: String,
    #[serde(rename = "type")]
    pub dependency_type: DependencyType,
}

/// One array-job launch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayJobRequest {
    pub job_name: String,
    /// Executable reference every element runs
    pub job_definition: String,
    pub job_queue: String,
    pub array_size: usize,
    #[serde(default)]
    pub depends_on: Vec<JobDependency>,
    /// Merged by the scheduler with each element's own array index
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Per-status element counts for one array job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementSummary {
    pub submitted: usize,
    pub pending: usize,
    pub runnable: usize,
    pub starting: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ElementSummary {
    /// Count one more element in `status`.
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Submitted => self.submitted += 1,
            JobStatus::Pending => self.pending += 1,
            JobStatus::Runnable => self.runnable += 1,
            JobStatus::Starting => self.starting += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    /// Elements that have not reached a terminal state.
    pub fn non_terminal(&self) -> usize {
        self.submitted + self.pending + self.runnable + self.starting + self.running
    }

    pub fn total(&self) -> usize {
        self.non_terminal() + self.succeeded + self.failed
    }
}

/// Scheduler-side view of one submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: String,
    pub job_name: String,
    /// Status of the job as a whole
    pub status: JobStatus,
    /// Array size, absent for a plain (non-array) job
    #[serde(default)]
    pub array_size: Option<usize>,
    /// Element counts, empty for a plain job
    #[serde(default)]
    pub elements: ElementSummary,
    #[serde(default)]
    pub status_reason: Option<String>,
}

impl JobDescription {
    /// Elements still pending or running. A plain job counts as one element.
    pub fn non_terminal_elements(&self) -> usize {
        if self.array_size.is_some() {
            self.elements.non_terminal()
        } else if self.status.is_terminal() {
            0
        } else {
            1
        }
    }

    /// Elements that terminated as FAILED. A plain job counts as one element.
    pub fn failed_elements(&self) -> usize {
        if self.array_size.is_some() {
            self.elements.failed
        } else if self.status == JobStatus::Failed {
            1
        } else {
            0
        }
    }

    /// Whether the job and every one of its elements are terminal.
    pub fn is_resolved(&self) -> bool {
        self.status.is_terminal() && self.non_terminal_elements() == 0
    }
}

/// Contract for the external array-job scheduler.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Submit one array job; returns the scheduler-assigned job id once the
    /// job is accepted (not completed).
    async fn submit_job(&self, request: &ArrayJobRequest) -> Result<String, SchedulerError>;

    /// Read-only status lookup for the given jobs.
    async fn describe_jobs(&self, job_ids: &[String]) -> Result<Vec<JobDescription>, SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        for status in [
            JobStatus::Submitted,
            JobStatus::Pending,
            JobStatus::Runnable,
            JobStatus::Starting,
            JobStatus::Running,
        ] {
            assert!(!status.is_terminal(), "{status} should not be terminal");
        }
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&JobStatus::Runnable).unwrap();
        assert_eq!(json, "\"RUNNABLE\"");
        let dep = JobDependency {
            job_id: "job-1".to_string(),
            dependency_type: DependencyType::NToN,
        };
        let json = serde_json::to_string(&dep).unwrap();
        assert_eq!(json, r#"{"job_id":"job-1","type":"N_TO_N"}"#);
    }

    #[test]
    fn test_plain_job_counts_as_one_element() {
        let job = JobDescription {
            job_id: "job-1".to_string(),
            job_name: "StepOneJob".to_string(),
            status: JobStatus::Failed,
            array_size: None,
            elements: ElementSummary::default(),
            status_reason: None,
        };
        assert_eq!(job.failed_elements(), 1);
        assert_eq!(job.non_terminal_elements(), 0);
        assert!(job.is_resolved());
    }

    #[test]
    fn test_array_job_not_resolved_until_elements_terminal() {
        let mut elements = ElementSummary::default();
        for _ in 0..9 {
            elements.record(JobStatus::Succeeded);
        }
        elements.record(JobStatus::Running);

        let job = JobDescription {
            job_id: "job-2".to_string(),
            job_name: "StepTwoJob".to_string(),
            status: JobStatus::Running,
            array_size: Some(10),
            elements,
            status_reason: None,
        };
        assert_eq!(elements.total(), 10);
        assert_eq!(job.non_terminal_elements(), 1);
        assert!(!job.is_resolved());
    }
}
