//! Step Batch CLI
//!
//! Runs, resumes and inspects three-stage array-job pipeline runs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use step_batch::io::{create_shared_store, RunStore};
use step_batch::partition::read_partition;
use step_batch::{build_runtime, resume_run, run_once, run_schedule, Config, RunOutcome, RunRecord};

#[derive(Parser)]
#[command(name = "step-batch")]
#[command(about = "Orchestrate a three-stage array-job pipeline", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Tokio worker threads (default: number of CPUs)
    #[arg(long, global = true)]
    worker_threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one run and wait for it to finish (default if no command specified)
    Run {
        /// Generate this many work items instead of using the configured source
        #[arg(long)]
        items: Option<usize>,
    },

    /// Continue a persisted run, e.g. after a restart
    Resume {
        run_id: String,
    },

    /// Print the persisted state of a run
    Status {
        run_id: String,
    },

    /// List known runs
    List,

    /// Ask the orchestrator driving a run to stop
    Abort {
        run_id: String,
    },

    /// Start a run on the configured schedule until ctrl-c
    Schedule,

    /// Print the work items assigned to one array element
    Items {
        run_id: String,
        index: usize,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run_command(cli.config, cli.worker_threads, None)?,
        Some(Commands::Run { items }) => run_command(cli.config, cli.worker_threads, items)?,
        Some(Commands::Resume { run_id }) => resume_command(cli.config, cli.worker_threads, &run_id)?,
        Some(Commands::Status { run_id }) => status_command(cli.config, &run_id)?,
        Some(Commands::List) => list_command(cli.config)?,
        Some(Commands::Abort { run_id }) => abort_command(cli.config, &run_id)?,
        Some(Commands::Schedule) => schedule_command(cli.config, cli.worker_threads)?,
        Some(Commands::Items { run_id, index }) => items_command(cli.config, &run_id, index)?,
        Some(Commands::Validate) => validate_command(cli.config)?,
        Some(Commands::GenerateConfig { output }) => generate_config_command(output)?,
    }

    Ok(())
}

fn load_config(config_path: &PathBuf) -> Result<Config> {
    Config::from_file(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))
}

fn run_command(config_path: PathBuf, worker_threads: Option<usize>, items: Option<usize>) -> Result<()> {
    let config = load_config(&config_path)?;
    let runtime = build_runtime(worker_threads)?;
    let record = runtime.block_on(run_once(config, items))?;
    report_outcome(&record)
}

fn resume_command(config_path: PathBuf, worker_threads: Option<usize>, run_id: &str) -> Result<()> {
    let config = load_config(&config_path)?;
    let runtime = build_runtime(worker_threads)?;
    let record = runtime.block_on(resume_run(config, run_id))?;
    report_outcome(&record)
}

fn schedule_command(config_path: PathBuf, worker_threads: Option<usize>) -> Result<()> {
    let config = load_config(&config_path)?;
    let runtime = build_runtime(worker_threads)?;
    let stats = runtime.block_on(run_schedule(config))?;
    println!("{}", stats);
    Ok(())
}

/// Print the final record; anything short of DONE is an error exit.
fn report_outcome(record: &RunRecord) -> Result<()> {
    println!("{}", record);

    match record.outcome() {
        Some(RunOutcome::Succeeded) => Ok(()),
        Some(RunOutcome::CompletedWithFailures { failed_elements }) => {
            tracing::warn!(
                "Run {} completed with {} failed elements; inspect before using its output",
                record.run_id,
                failed_elements
            );
            Ok(())
        }
        Some(outcome) => anyhow::bail!("Run {} {}", record.run_id, outcome),
        None => anyhow::bail!("Run {} stopped in state {}", record.run_id, record.state),
    }
}

fn open_run_store(config_path: &PathBuf) -> Result<RunStore> {
    let config = load_config(config_path)?;
    config.validate()?;
    let store = create_shared_store(&config)?;
    Ok(RunStore::new(store, config.poll.retry.clone()))
}

fn status_command(config_path: PathBuf, run_id: &str) -> Result<()> {
    let runs = open_run_store(&config_path)?;
    let runtime = build_runtime(Some(1))?;

    let record = runtime.block_on(runs.load(run_id))?;
    println!("{}", record);
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn list_command(config_path: PathBuf) -> Result<()> {
    let runs = open_run_store(&config_path)?;
    let runtime = build_runtime(Some(1))?;

    runtime.block_on(async {
        for run_id in runs.list().await? {
            match runs.load(&run_id).await {
                Ok(record) => println!("{}  {}  {}", record.run_id, record.state, record.updated_at),
                Err(e) => println!("{}  unreadable: {}", run_id, e),
            }
        }
        Ok(())
    })
}

fn abort_command(config_path: PathBuf, run_id: &str) -> Result<()> {
    let runs = open_run_store(&config_path)?;
    let runtime = build_runtime(Some(1))?;

    runtime.block_on(runs.request_abort(run_id))?;
    println!("Abort requested for run {}", run_id);
    Ok(())
}

fn items_command(config_path: PathBuf, run_id: &str, index: usize) -> Result<()> {
    let config = load_config(&config_path)?;
    config.validate()?;
    let store = create_shared_store(&config)?;
    let runtime = build_runtime(Some(1))?;

    let items = runtime
        .block_on(read_partition(store.as_ref(), run_id, index))
        .with_context(|| format!("No partition {} for run {}", index, run_id))?;
    for item in items {
        println!("{}", item);
    }
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Step Batch Configuration

# === STORAGE: Shared storage for partitions, stage data and run state ===
# Choose ONE of: local_path (mounted shared volume) OR bucket+prefix (S3)
storage:
  # Option 1: Shared filesystem mounted on every compute node
  local_path: "/mnt/batch"

  # Option 2: S3 (comment out local_path and uncomment these)
  # bucket: "shared-bucket"
  # prefix: "step-batch"

# === AWS: S3 connection settings ===
aws:
  region: "us-east-1"

  # Custom S3 endpoint (for LocalStack, MinIO, etc.)
  # endpoint_url: "http://localhost:4566"

# === SCHEDULER: Where array jobs are submitted ===
scheduler:
  # http: JSON API (POST jobs, POST jobs/describe)
  # simulated: in-process fake, for trying the pipeline out
  kind: http
  endpoint: "http://localhost:8080/"
  request_timeout_secs: 10

  # How long simulated jobs run
  simulated_runtime_secs: 60

# === PARTITION: Splitting work across array elements ===
partition:
  # Upper bound on elements per stage
  max_nodes: 10000

  # Items per element before another element is added
  node_task_limit: 5

  # random: generate between min_items and max_items ids
  # manifest: newline-delimited ids at a path in shared storage
  work_source:
    random:
      min_items: 20
      max_items: 50
  # work_source:
  #   manifest:
  #     path: "inputs/ids.txt"

# === STAGES: Exactly three, in execution order ===
# Each stage runs one element per partition. dependency_type is JOB (the
# whole previous job must finish) or N_TO_N (element i waits on element i).
stages:
  - name: StepOneJob
    job_definition: get-data
    job_queue: StepOneJobQueue

  - name: StepTwoJob
    job_definition: process-data
    job_queue: StepTwoJobQueue
    dependency_type: JOB

  - name: StepThreeJob
    job_definition: egress-data
    job_queue: StepThreeJobQueue
    dependency_type: JOB
    # Passed to every element as RESULTS_DESTINATION
    egress_destination: "s3://egress-bucket"
    # Variable names elements read (defaults RUN_ID, RESULTS_DESTINATION)
    # run_id_env: STEP_FN_ID
    # results_destination_env: RESULTS_BUCKET

# === POLL: Waiting for the run to finish ===
poll:
  # Seconds between polls
  interval_secs: 30

  # Give up after this many seconds (null = never)
  timeout_secs: 86400

  # Retry configuration for run-state writes
  retry:
    max_retries: 3
    initial_backoff_ms: 100
    max_backoff_ms: 10000

# === POLICY ===
policy:
  # FAILED instead of DONE when any element failed
  fail_on_element_failure: false

# === SCHEDULE: Used by the `schedule` command ===
schedule:
  # Once a day
  interval_secs: 86400

# Save run metrics JSON here after each command (optional)
# metrics_output_path: "metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["step-batch"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_run_with_items() {
        let cli = Cli::try_parse_from(["step-batch", "run", "--items", "100", "-c", "other.yaml"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run { items: Some(100) })));
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
    }

    #[test]
    fn test_cli_parse_run_commands() {
        let cli = Cli::try_parse_from(["step-batch", "resume", "run-1"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Resume { run_id }) if run_id == "run-1"));

        let cli = Cli::try_parse_from(["step-batch", "items", "run-1", "7"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Items { index: 7, .. })));

        assert!(Cli::try_parse_from(["step-batch", "abort"]).is_err());
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["step-batch", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");

        generate_config_command(path.clone()).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.stages.len(), 3);
    }
}
