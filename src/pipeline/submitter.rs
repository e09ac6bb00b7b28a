//! Stage submission and the dependency chain between stages.
//!
//! Ordering is not enforced here at runtime: each submission carries a
//! declarative link to the previous stage's job and the scheduler holds the
//! downstream elements back. The chain is strictly linear, so it is kept as
//! an ordered list of (stage, job id) rather than a graph.

use super::state::{RunContext, StageSubmission};
use crate::config::{StageConfig, PIPELINE_STAGES};
use crate::error::OrchestratorError;
use crate::scheduler::{ArrayJobRequest, DependencyType, JobDependency, JobScheduler};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ordered stage -> job id links for one run.
#[derive(Debug, Clone, Default)]
pub struct DependencyChain {
    job_ids: Vec<(usize, String)>,
}

impl DependencyChain {
    /// Rebuild the chain from a run's accepted submissions.
    pub fn from_submissions(stages: &[StageSubmission]) -> Self {
        Self {
            job_ids: stages
                .iter()
                .map(|s| (s.stage_index, s.job_id.clone()))
                .collect(),
        }
    }

    pub fn job_id(&self, stage_index: usize) -> Option<&str> {
        self.job_ids
            .iter()
            .find(|(k, _)| *k == stage_index)
            .map(|(_, id)| id.as_str())
    }

    /// Upstream links for stage `stage_index`.
    ///
    /// Stage 1 has none; stage k waits on exactly stage k-1, whose job id
    /// must already be known.
    pub fn dependencies_for(
        &self,
        stage_index: usize,
        dependency_type: DependencyType,
    ) -> Result<Vec<JobDependency>, OrchestratorError> {
        if !(1..=PIPELINE_STAGES).contains(&stage_index) {
            return Err(OrchestratorError::invalid_submission(
                stage_index,
                format!("stage index must be within 1..={}", PIPELINE_STAGES),
            ));
        }
        if self.job_id(stage_index).is_some() {
            return Err(OrchestratorError::invalid_submission(
                stage_index,
                "stage was already submitted",
            ));
        }
        if stage_index == 1 {
            return Ok(Vec::new());
        }

        let upstream = self.job_id(stage_index - 1).ok_or_else(|| {
            OrchestratorError::invalid_submission(
                stage_index,
                format!("job id of stage {} is not known yet", stage_index - 1),
            )
        })?;

        Ok(vec![JobDependency {
            job_id: upstream.to_string(),
            dependency_type,
        }])
    }
}

/// Environment every element of `stage` receives, under the stage's
/// configured variable names.
pub fn stage_environment(ctx: &RunContext, stage: &StageConfig) -> BTreeMap<String, String> {
    let mut env = stage.environment.clone();
    env.insert(stage.run_id_env.clone(), ctx.run_id.clone());
    if let Some(destination) = &stage.egress_destination {
        env.insert(stage.results_destination_env.clone(), destination.clone());
    }
    env
}

/// Submits one stage as an array job and waits for acceptance.
#[derive(Clone)]
pub struct StageSubmitter {
    scheduler: Arc<dyn JobScheduler>,
}

impl StageSubmitter {
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { scheduler }
    }

    /// Submit stage `stage_index` and return the scheduler's job id.
    ///
    /// Malformed submissions fail with `InvalidSubmission` before the
    /// scheduler is contacted.
    pub async fn submit(
        &self,
        stage_index: usize,
        stage: &StageConfig,
        array_size: usize,
        depends_on: &[JobDependency],
        environment: BTreeMap<String, String>,
    ) -> Result<String, OrchestratorError> {
        if array_size == 0 {
            return Err(OrchestratorError::invalid_submission(
                stage_index,
                "array size must be > 0",
            ));
        }
        if stage.job_definition.is_empty() {
            return Err(OrchestratorError::invalid_submission(
                stage_index,
                "executable reference is empty",
            ));
        }
        if stage_index > 1 && depends_on.is_empty() {
            return Err(OrchestratorError::invalid_submission(
                stage_index,
                "missing dependency on the previous stage",
            ));
        }
        if depends_on.iter().any(|dep| dep.job_id.trim().is_empty()) {
            return Err(OrchestratorError::invalid_submission(
                stage_index,
                "dependency references an empty job id",
            ));
        }

        let request = ArrayJobRequest {
            job_name: stage.name.clone(),
            job_definition: stage.job_definition.clone(),
            job_queue: stage.job_queue.clone(),
            array_size,
            depends_on: depends_on.to_vec(),
            environment,
        };

        let job_id = self
            .scheduler
            .submit_job(&request)
            .await
            .map_err(|source| OrchestratorError::SubmissionRejected {
                stage: stage_index,
                source,
            })?;

        tracing::info!(
            "Submitted stage {} ({}) as job {} with {} elements",
            stage_index,
            stage.name,
            job_id,
            array_size
        );
        Ok(job_id)
    }
}
