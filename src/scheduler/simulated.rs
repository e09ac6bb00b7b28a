//! In-process simulated scheduler.
//!
//! Jobs start once all of their dependencies are terminal and every element
//! finishes a fixed runtime later, measured on the tokio clock (so paused-time
//! tests advance it for free). Failures, rejections and transient describe
//! errors are scripted up front by job name.
//!
//! Failure propagation along dependency links is not modelled: a downstream
//! job starts after its upstream resolves even if some upstream elements
//! failed.

use super::{ArrayJobRequest, ElementSummary, JobDescription, JobScheduler, JobStatus};
use crate::error::SchedulerError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct SimulatedJob {
    request: ArrayJobRequest,
    submitted_at: Instant,
}

#[derive(Default)]
struct SimulatedState {
    next_id: u64,
    jobs: HashMap<String, SimulatedJob>,
    /// Submission order, for inspection
    submissions: Vec<(String, ArrayJobRequest)>,
    /// Job name -> element indices that finish FAILED
    element_failures: HashMap<String, BTreeSet<usize>>,
    /// Job names the scheduler refuses
    rejected: HashSet<String>,
    /// Remaining describe calls that fail with Unavailable
    describe_failures: u32,
    describe_calls: u64,
}

/// Scheduler fake driven by the tokio clock.
pub struct SimulatedScheduler {
    runtime: Duration,
    state: Mutex<SimulatedState>,
}

impl SimulatedScheduler {
    /// Create a scheduler whose elements each run for `runtime`.
    pub fn new(runtime: Duration) -> Self {
        Self {
            runtime,
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// Elements `indices` of every job named `job_name` finish FAILED.
    pub fn with_element_failures(
        mut self,
        job_name: &str,
        indices: impl IntoIterator<Item = usize>,
    ) -> Self {
        self.state
            .get_mut()
            .element_failures
            .entry(job_name.to_string())
            .or_default()
            .extend(indices);
        self
    }

    /// Refuse submissions of jobs named `job_name`.
    pub fn with_rejected_job(mut self, job_name: &str) -> Self {
        self.state.get_mut().rejected.insert(job_name.to_string());
        self
    }

    /// Fail the next `count` describe calls as unavailable.
    pub async fn fail_next_describes(&self, count: u32) {
        self.state.lock().await.describe_failures = count;
    }

    /// Accepted submissions in order, with their assigned job ids.
    pub async fn submissions(&self) -> Vec<(String, ArrayJobRequest)> {
        self.state.lock().await.submissions.clone()
    }

    /// Number of describe calls received, failed ones included.
    pub async fn describe_calls(&self) -> u64 {
        self.state.lock().await.describe_calls
    }

    /// When the job's elements become eligible to run.
    fn start_time(state: &SimulatedState, job: &SimulatedJob, runtime: Duration) -> Instant {
        job.request
            .depends_on
            .iter()
            .filter_map(|dep| state.jobs.get(&dep.job_id))
            .map(|upstream| Self::start_time(state, upstream, runtime) + runtime)
            .fold(job.submitted_at, Instant::max)
    }

    fn describe(&self, state: &SimulatedState, job_id: &str, now: Instant) -> Option<JobDescription> {
        let job = state.jobs.get(job_id)?;
        let start = Self::start_time(state, job, self.runtime);
        let finish = start + self.runtime;
        let failures = state.element_failures.get(&job.request.job_name);

        let mut elements = ElementSummary::default();
        for index in 0..job.request.array_size {
            let status = if now < start {
                JobStatus::Pending
            } else if now < finish {
                JobStatus::Running
            } else if failures.is_some_and(|f| f.contains(&index)) {
                JobStatus::Failed
            } else {
                JobStatus::Succeeded
            };
            elements.record(status);
        }

        let status = if now < start {
            JobStatus::Pending
        } else if now < finish {
            JobStatus::Running
        } else if elements.failed > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        };

        Some(JobDescription {
            job_id: job_id.to_string(),
            job_name: job.request.job_name.clone(),
            status,
            array_size: Some(job.request.array_size),
            elements,
            status_reason: (elements.failed > 0)
                .then(|| format!("{} array elements failed", elements.failed)),
        })
    }
}

#[async_trait]
impl JobScheduler for SimulatedScheduler {
    async fn submit_job(&self, request: &ArrayJobRequest) -> Result<String, SchedulerError> {
        let mut state = self.state.lock().await;

        if state.rejected.contains(&request.job_name) {
            return Err(SchedulerError::rejected(format!(
                "job queue {} refused {}",
                request.job_queue, request.job_name
            )));
        }
        if let Some(dep) = request
            .depends_on
            .iter()
            .find(|dep| !state.jobs.contains_key(&dep.job_id))
        {
            return Err(SchedulerError::rejected(format!(
                "dependency {} does not exist",
                dep.job_id
            )));
        }

        state.next_id += 1;
        let job_id = format!("sim-{:04}-{}", state.next_id, request.job_name);
        state.jobs.insert(
            job_id.clone(),
            SimulatedJob {
                request: request.clone(),
                submitted_at: Instant::now(),
            },
        );
        state.submissions.push((job_id.clone(), request.clone()));

        tracing::debug!("Simulated scheduler accepted {} as {}", request.job_name, job_id);
        Ok(job_id)
    }

    async fn describe_jobs(&self, job_ids: &[String]) -> Result<Vec<JobDescription>, SchedulerError> {
        let mut state = self.state.lock().await;
        state.describe_calls += 1;

        if state.describe_failures > 0 {
            state.describe_failures -= 1;
            return Err(SchedulerError::unavailable("simulated describe failure"));
        }

        let now = Instant::now();
        job_ids
            .iter()
            .map(|job_id| {
                self.describe(&state, job_id, now)
                    .ok_or_else(|| SchedulerError::UnknownJob {
                        job_id: job_id.clone(),
                    })
            })
            .collect()
    }
}
