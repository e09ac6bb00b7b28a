//! Step Batch
//!
//! Orchestrates a three-stage data pipeline on an external array-job
//! scheduler. A run partitions its work items into equally sized slices in
//! shared storage, submits each stage as an array job with one element per
//! slice, chains the stages with scheduler-side dependencies and polls until
//! every element is terminal.
//!
//! # Architecture
//!
//! - **Partition**: sizing and layout of per-node work slices
//! - **Scheduler**: the array-job scheduler seam (HTTP client, simulator)
//! - **Pipeline**: run state machine, stage submission, completion polling,
//!   fixed-schedule trigger and metrics
//! - **I/O**: object store construction and persisted run records
//!
//! # Usage
//!
//! ```no_run
//! use step_batch::{run_once, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let record = run_once(config, None).await?;
//!     println!("{}", record);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod partition;
pub mod pipeline;
pub mod scheduler;

pub use config::Config;
pub use error::{OrchestratorError, PartitionError, SchedulerError};
pub use partition::{ElementContext, Partitioner};
pub use pipeline::{Metrics, Orchestrator, RunOutcome, RunRecord, RunState, Trigger, TriggerStats};
pub use scheduler::{HttpScheduler, JobScheduler, SimulatedScheduler};

use anyhow::{Context, Result};
use config::SchedulerKind;
use partition::FixedWorkSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Build the configured scheduler backend.
pub fn connect_scheduler(config: &Config) -> Result<Arc<dyn JobScheduler>> {
    match config.scheduler.kind {
        SchedulerKind::Http => {
            let endpoint = config
                .scheduler
                .endpoint
                .as_deref()
                .context("The http scheduler requires an endpoint")?;
            let timeout = Duration::from_secs(config.scheduler.request_timeout_secs);
            Ok(Arc::new(HttpScheduler::new(endpoint, timeout)?))
        }
        SchedulerKind::Simulated => {
            tracing::warn!("Using the simulated scheduler; no real jobs will run");
            let runtime = Duration::from_secs(config.scheduler.simulated_runtime_secs);
            Ok(Arc::new(SimulatedScheduler::new(runtime)))
        }
    }
}

/// Validate `config` and wire an orchestrator to its storage and scheduler.
///
/// `items` replaces the configured work source with that many generated ids.
pub fn build_orchestrator(config: Config, items: Option<usize>) -> Result<Orchestrator> {
    config.validate()?;

    tracing::info!("Shared storage: {}", config.storage.path_display());
    let store = io::create_shared_store(&config)?;
    let scheduler = connect_scheduler(&config)?;

    let orchestrator = Orchestrator::new(Arc::new(config), store, scheduler);
    Ok(match items {
        Some(count) => orchestrator.with_work_source(Arc::new(FixedWorkSource { count })),
        None => orchestrator,
    })
}

/// Start one run and drive it to a terminal state.
pub async fn run_once(config: Config, items: Option<usize>) -> Result<RunRecord> {
    let metrics_output_path = config.metrics_output_path.clone();
    let orchestrator = build_orchestrator(config, items)?;

    tracing::info!("Starting run");
    let record = orchestrator.run().await.context("Run could not be driven")?;

    report_metrics(&orchestrator, metrics_output_path.as_deref());
    Ok(record)
}

/// Continue a persisted run after a restart.
pub async fn resume_run(config: Config, run_id: &str) -> Result<RunRecord> {
    let metrics_output_path = config.metrics_output_path.clone();
    let orchestrator = build_orchestrator(config, None)?;

    let record = orchestrator
        .resume(run_id)
        .await
        .with_context(|| format!("Failed to resume run {}", run_id))?;

    report_metrics(&orchestrator, metrics_output_path.as_deref());
    Ok(record)
}

/// Trigger runs on the configured schedule until ctrl-c.
pub async fn run_schedule(config: Config) -> Result<TriggerStats> {
    let interval = Duration::from_secs(config.schedule.interval_secs);
    let metrics_output_path = config.metrics_output_path.clone();
    let orchestrator = Arc::new(build_orchestrator(config, None)?);

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let trigger = Trigger::new(orchestrator.clone(), interval);
    let handle = tokio::spawn(trigger.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(()).await;
    let stats = handle.await?;

    report_metrics(&orchestrator, metrics_output_path.as_deref());
    tracing::info!("Trigger stopped: {}", stats);
    Ok(stats)
}

fn report_metrics(orchestrator: &Orchestrator, output_path: Option<&str>) {
    let metrics = orchestrator.metrics();
    metrics.print_summary();

    if let Some(path) = output_path {
        if let Err(e) = metrics.snapshot().save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path, e);
        }
    }
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
