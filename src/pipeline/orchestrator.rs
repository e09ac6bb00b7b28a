//! The orchestrator: drives one run from partitioning to a terminal state.
//!
//! Execution is one state at a time. After every transition the run record is
//! written to shared storage, and the wait between polls is a timed sleep
//! whose wake-up time is part of that record. A process that dies mid-run can
//! therefore be replaced by another calling [`Orchestrator::resume`].

use super::metrics::Metrics;
use super::poller::CompletionPoller;
use super::state::{RunRecord, RunState, StageSubmission};
use super::submitter::{stage_environment, DependencyChain, StageSubmitter};
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::io::RunStore;
use crate::partition::{work_source_from_config, Partitioner, WorkSource};
use crate::scheduler::JobScheduler;
use chrono::Utc;
use object_store::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Sequences partitioner, stage submissions and completion polling.
pub struct Orchestrator {
    config: Arc<Config>,
    runs: RunStore,
    partitioner: Partitioner,
    work_source: Arc<dyn WorkSource>,
    submitter: StageSubmitter,
    poller: CompletionPoller,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    /// Create an orchestrator over shared storage and a scheduler.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ObjectStore>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        let work_source = work_source_from_config(&config.partition.work_source, store.clone());

        Self {
            runs: RunStore::new(store.clone(), config.poll.retry.clone()),
            partitioner: Partitioner::new(store, config.partition.node_task_limit),
            work_source,
            submitter: StageSubmitter::new(scheduler.clone()),
            poller: CompletionPoller::new(scheduler),
            metrics: Metrics::new(),
            config,
        }
    }

    /// Replace the configured work source.
    pub fn with_work_source(mut self, work_source: Arc<dyn WorkSource>) -> Self {
        self.work_source = work_source;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// Start a new run and drive it to a terminal state.
    pub async fn run(&self) -> Result<RunRecord, OrchestratorError> {
        let record = self.start().await?;
        self.drive(record).await
    }

    /// Continue a persisted run from its recorded state.
    pub async fn resume(&self, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        let record = self.runs.load(run_id).await?;
        tracing::info!("Resuming {}", record);
        self.drive(record).await
    }

    /// Request that `run_id` stops at its next step.
    pub async fn abort(&self, run_id: &str) -> Result<(), OrchestratorError> {
        self.runs.request_abort(run_id).await?;
        tracing::info!("Abort requested for run {}", run_id);
        Ok(())
    }

    /// Current persisted record of `run_id`.
    pub async fn status(&self, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        self.runs.load(run_id).await
    }

    /// INIT: gather work and partition it under a new run id.
    ///
    /// A partitioning failure yields a FAILED record with no stages; only a
    /// failure to persist the record is returned as an error.
    pub async fn start(&self) -> Result<RunRecord, OrchestratorError> {
        let partitioned = match self.partition().await {
            Ok(partitioned) => partitioned,
            Err(e) => {
                let mut record = RunRecord::new(uuid::Uuid::new_v4().to_string(), 0);
                record.fail(&e);
                self.metrics.add_run_failed();
                if let Err(save_err) = self.runs.save(&record).await {
                    tracing::warn!("Could not persist failed run {}: {}", record.run_id, save_err);
                }
                return Ok(record);
            }
        };

        self.metrics.add_run_started(partitioned.plan.total_items);

        let mut record = RunRecord::new(partitioned.run_id, partitioned.plan.total_nodes);
        record.transition(RunState::SubmitStage1);
        self.runs.save(&record).await?;
        Ok(record)
    }

    async fn partition(&self) -> Result<crate::partition::Partitioned, OrchestratorError> {
        let items = self.work_source.work_items().await?;
        let partitioned = self
            .partitioner
            .partition(&items, self.config.partition.max_nodes)
            .await?;
        Ok(partitioned)
    }

    /// Step `record` until it reaches a terminal state, persisting each move.
    pub async fn drive(&self, mut record: RunRecord) -> Result<RunRecord, OrchestratorError> {
        if record.state.is_terminal() {
            return Ok(record);
        }

        let deadline = self.poll_deadline(&record);

        loop {
            if self.abort_requested(&record.run_id).await {
                tracing::warn!("Run {} aborted by request", record.run_id);
                record.next_poll_at = None;
                record.transition(RunState::Aborted);
            } else {
                match self.advance(&mut record, deadline).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => record.fail(&e),
                    Err(e) => {
                        record.consecutive_poll_errors += 1;
                        tracing::warn!(
                            "Run {}: {} ({} in a row), retrying after the poll interval",
                            record.run_id,
                            e,
                            record.consecutive_poll_errors
                        );
                        self.continue_polling(&mut record, deadline);
                    }
                }
            }

            self.runs.save(&record).await?;

            if record.state.is_terminal() {
                self.finish(&record);
                return Ok(record);
            }
        }
    }

    /// Execute the current state once.
    pub async fn step(&self, record: &mut RunRecord) -> Result<(), OrchestratorError> {
        let deadline = self.poll_deadline(record);
        self.advance(record, deadline).await
    }

    async fn advance(
        &self,
        record: &mut RunRecord,
        deadline: Option<Instant>,
    ) -> Result<(), OrchestratorError> {
        match record.state {
            RunState::Init => {
                record.transition(RunState::SubmitStage1);
                Ok(())
            }
            RunState::SubmitStage1 => self.submit_stage(record, 1).await,
            RunState::SubmitStage2 => self.submit_stage(record, 2).await,
            RunState::SubmitStage3 => self.submit_stage(record, 3).await,
            RunState::Poll => self.poll(record, deadline).await,
            RunState::WaitAndRetryPoll => {
                self.wait(record, deadline).await;
                Ok(())
            }
            RunState::Done | RunState::Failed | RunState::Aborted | RunState::TimedOut => Ok(()),
        }
    }

    /// An unreadable abort marker counts as not requested; the next step
    /// checks again.
    async fn abort_requested(&self, run_id: &str) -> bool {
        match self.runs.abort_requested(run_id).await {
            Ok(requested) => requested,
            Err(e) => {
                tracing::warn!("Could not check abort marker of run {}: {}", run_id, e);
                false
            }
        }
    }

    async fn submit_stage(&self, record: &mut RunRecord, k: usize) -> Result<(), OrchestratorError> {
        let stage = self.config.stages.get(k - 1).ok_or_else(|| {
            OrchestratorError::invalid_submission(k, "no stage configured at this position")
        })?;

        let chain = DependencyChain::from_submissions(&record.stages);
        let depends_on = chain.dependencies_for(k, stage.dependency_type)?;
        let ctx = record.context();
        let environment = stage_environment(&ctx, stage);

        let job_id = self
            .submitter
            .submit(k, stage, ctx.total_nodes, &depends_on, environment)
            .await?;
        self.metrics.add_stage_submitted();

        record.stages.push(StageSubmission {
            stage_index: k,
            stage_name: stage.name.clone(),
            job_id,
            array_size: ctx.total_nodes,
            depends_on: depends_on.into_iter().map(|dep| dep.job_id).collect(),
            submitted_at: Utc::now(),
        });
        record.transition(RunState::submit_stage(k + 1).unwrap_or(RunState::Poll));
        Ok(())
    }

    async fn poll(
        &self,
        record: &mut RunRecord,
        deadline: Option<Instant>,
    ) -> Result<(), OrchestratorError> {
        record.poll_attempts += 1;
        let result = self.poller.poll(&record.job_ids()).await;
        self.metrics.add_poll(result.is_err());
        let result = result.map_err(OrchestratorError::Poll)?;

        record.consecutive_poll_errors = 0;
        record.last_poll = Some(result);

        if !result.finished {
            tracing::info!(
                "Run {} not finished after poll {}",
                record.run_id,
                record.poll_attempts
            );
            self.continue_polling(record, deadline);
            return Ok(());
        }

        record.next_poll_at = None;
        self.metrics.add_failed_elements(result.failed_elements);

        if result.failed_elements > 0 {
            if self.config.policy.fail_on_element_failure {
                record.fail(format!("{} array elements failed", result.failed_elements));
                return Ok(());
            }
            tracing::warn!(
                "Run {} finished with {} failed elements",
                record.run_id,
                result.failed_elements
            );
        }
        record.transition(RunState::Done);
        Ok(())
    }

    /// WAIT_AND_RETRY_POLL: sleep until the recorded wake-up time, or until
    /// the deadline if that comes first.
    async fn wait(&self, record: &mut RunRecord, deadline: Option<Instant>) {
        let mut remaining = record
            .next_poll_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO)
            .min(self.poll_interval());
        if let Some(deadline) = deadline {
            remaining = remaining.min(deadline.saturating_duration_since(Instant::now()));
        }

        tracing::debug!("Run {} sleeping {:?} before next poll", record.run_id, remaining);
        tokio::time::sleep(remaining).await;

        record.next_poll_at = None;
        record.transition(RunState::Poll);
    }

    /// After an unfinished or failed poll: wait for another one, or give up
    /// once the deadline has passed. The poll that just ran was the last.
    fn continue_polling(&self, record: &mut RunRecord, deadline: Option<Instant>) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::error!(
                "Run {} still unfinished after {} polls, giving up",
                record.run_id,
                record.poll_attempts
            );
            record.next_poll_at = None;
            record.transition(RunState::TimedOut);
            return;
        }

        record.next_poll_at =
            Some(Utc::now() + chrono::Duration::seconds(self.config.poll.interval_secs as i64));
        record.transition(RunState::WaitAndRetryPoll);
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll.interval_secs)
    }

    /// Point on the tokio clock at which polling gives up.
    ///
    /// Measured from the run's creation, so time spent before a restart
    /// counts against the budget.
    fn poll_deadline(&self, record: &RunRecord) -> Option<Instant> {
        self.config.poll.timeout_secs.map(|secs| {
            let elapsed = (Utc::now() - record.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            Instant::now() + Duration::from_secs(secs).saturating_sub(elapsed)
        })
    }

    fn finish(&self, record: &RunRecord) {
        match record.state {
            RunState::Done => self.metrics.add_run_completed(),
            _ => self.metrics.add_run_failed(),
        }
        tracing::info!("{}", record);
    }
}
