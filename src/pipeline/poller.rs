//! Completion polling.
//!
//! The scheduler never pushes a completion event, so the orchestrator asks.
//! Polling is read-only: it can be repeated as often as needed without
//! touching job state.

use crate::error::SchedulerError;
use crate::scheduler::JobScheduler;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot produced by one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResult {
    /// Every element of every tracked job is terminal
    pub finished: bool,
    /// Elements that terminated as FAILED
    pub failed_elements: usize,
}

/// Stateless poller over the scheduler's job status.
#[derive(Clone)]
pub struct CompletionPoller {
    scheduler: Arc<dyn JobScheduler>,
}

impl CompletionPoller {
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { scheduler }
    }

    /// Inspect every job submitted so far for a run.
    ///
    /// A job the scheduler does not report back is treated as a poll error
    /// rather than as finished.
    pub async fn poll(&self, job_ids: &[String]) -> Result<PollResult, SchedulerError> {
        let jobs = self.scheduler.describe_jobs(job_ids).await?;
        let by_id: HashMap<&str, _> = jobs.iter().map(|j| (j.job_id.as_str(), j)).collect();

        let mut finished = true;
        let mut failed_elements = 0;

        for job_id in job_ids {
            let job = by_id
                .get(job_id.as_str())
                .ok_or_else(|| SchedulerError::UnknownJob {
                    job_id: job_id.clone(),
                })?;

            tracing::debug!(
                "Job {} ({}): {} | {} pending/running, {} succeeded, {} failed",
                job.job_name,
                job.job_id,
                job.status,
                job.non_terminal_elements(),
                job.elements.succeeded,
                job.failed_elements()
            );

            if !job.is_resolved() {
                finished = false;
            }
            failed_elements += job.failed_elements();
        }

        Ok(PollResult {
            finished,
            failed_elements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{
        ArrayJobRequest, ElementSummary, JobDescription, JobStatus, SimulatedScheduler,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Scheduler returning a fixed set of descriptions.
    struct FixedScheduler(Vec<JobDescription>);

    #[async_trait]
    impl JobScheduler for FixedScheduler {
        async fn submit_job(&self, _request: &ArrayJobRequest) -> Result<String, SchedulerError> {
            Err(SchedulerError::rejected("read-only"))
        }

        async fn describe_jobs(&self, job_ids: &[String]) -> Result<Vec<JobDescription>, SchedulerError> {
            Ok(self
                .0
                .iter()
                .filter(|j| job_ids.contains(&j.job_id))
                .cloned()
                .collect())
        }
    }

    fn job(job_id: &str, status: JobStatus, statuses: &[(JobStatus, usize)]) -> JobDescription {
        let mut elements = ElementSummary::default();
        for &(s, count) in statuses {
            for _ in 0..count {
                elements.record(s);
            }
        }
        JobDescription {
            job_id: job_id.to_string(),
            job_name: job_id.to_uppercase(),
            status,
            array_size: Some(elements.total()),
            elements,
            status_reason: None,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_not_finished_while_any_element_active() {
        let poller = CompletionPoller::new(Arc::new(FixedScheduler(vec![
            job("one", JobStatus::Succeeded, &[(JobStatus::Succeeded, 10)]),
            job("two", JobStatus::Succeeded, &[(JobStatus::Succeeded, 10)]),
            job(
                "three",
                JobStatus::Running,
                &[(JobStatus::Succeeded, 9), (JobStatus::Runnable, 1)],
            ),
        ])));

        let result = poller.poll(&ids(&["one", "two", "three"])).await.unwrap();
        assert!(!result.finished);
        assert_eq!(result.failed_elements, 0);
    }

    #[tokio::test]
    async fn test_earlier_stage_keeps_run_unfinished() {
        // Only the most recent stage being terminal is not enough.
        let poller = CompletionPoller::new(Arc::new(FixedScheduler(vec![
            job("one", JobStatus::Running, &[(JobStatus::Running, 1), (JobStatus::Succeeded, 9)]),
            job("three", JobStatus::Succeeded, &[(JobStatus::Succeeded, 10)]),
        ])));

        let result = poller.poll(&ids(&["one", "three"])).await.unwrap();
        assert!(!result.finished);
    }

    #[tokio::test]
    async fn test_finished_with_failures() {
        let poller = CompletionPoller::new(Arc::new(FixedScheduler(vec![
            job("one", JobStatus::Succeeded, &[(JobStatus::Succeeded, 10)]),
            job(
                "two",
                JobStatus::Failed,
                &[(JobStatus::Succeeded, 8), (JobStatus::Failed, 2)],
            ),
            job("three", JobStatus::Succeeded, &[(JobStatus::Succeeded, 10)]),
        ])));

        let job_ids = ids(&["one", "two", "three"]);
        let first = poller.poll(&job_ids).await.unwrap();
        assert_eq!(
            first,
            PollResult {
                finished: true,
                failed_elements: 2
            }
        );

        // Idempotent over a terminal job set
        for _ in 0..3 {
            assert_eq!(poller.poll(&job_ids).await.unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_missing_job_is_a_poll_error() {
        let poller = CompletionPoller::new(Arc::new(FixedScheduler(vec![job(
            "one",
            JobStatus::Succeeded,
            &[(JobStatus::Succeeded, 2)],
        )])));

        let result = poller.poll(&ids(&["one", "ghost"])).await;
        assert!(matches!(result, Err(SchedulerError::UnknownJob { job_id }) if job_id == "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_against_simulated_scheduler() {
        let scheduler = Arc::new(SimulatedScheduler::new(Duration::from_secs(30)));
        let request = ArrayJobRequest {
            job_name: "StepOneJob".to_string(),
            job_definition: "get-data".to_string(),
            job_queue: "StepOneJobQueue".to_string(),
            array_size: 3,
            depends_on: Vec::new(),
            environment: BTreeMap::new(),
        };
        let job_id = scheduler.submit_job(&request).await.unwrap();
        let poller = CompletionPoller::new(scheduler.clone());

        assert!(!poller.poll(&[job_id.clone()]).await.unwrap().finished);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(poller.poll(&[job_id]).await.unwrap().finished);
    }
}
