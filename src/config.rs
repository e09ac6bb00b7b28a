//! Configuration for the step-batch orchestrator.

use crate::partition::{RESULTS_DESTINATION_ENV, RUN_ID_ENV};
use crate::scheduler::DependencyType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Number of sequential stages in the pipeline.
pub const PIPELINE_STAGES: usize = 3;

/// Main configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared storage holding partitions, intermediate data and run state
    pub storage: StorageConfig,

    /// AWS connection settings for S3-backed storage
    #[serde(default)]
    pub aws: AwsConfig,

    /// Array-job scheduler backend
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Work partitioning
    #[serde(default)]
    pub partition: PartitionConfig,

    /// The three stages, in execution order
    pub stages: Vec<StageConfig>,

    /// Completion polling
    #[serde(default)]
    pub poll: PollConfig,

    /// Run outcome policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Fixed-schedule trigger
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Optional path to save run metrics JSON after a run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

/// Shared storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local filesystem root (e.g. a mounted shared volume).
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket (required if local_path is not set)
    #[serde(default)]
    pub bucket: Option<String>,

    /// S3 key prefix (required if local_path is not set)
    #[serde(default)]
    pub prefix: Option<String>,
}

impl StorageConfig {
    /// Get the storage root as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or("")
            )
        }
    }
}

/// AWS connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom S3 endpoint (LocalStack, MinIO, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
        }
    }
}

/// Which scheduler backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// JSON-over-HTTP scheduler API
    Http,
    /// In-process simulated scheduler
    Simulated,
}

/// Scheduler backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Backend kind
    #[serde(default = "default_scheduler_kind")]
    pub kind: SchedulerKind,

    /// Base URL of the scheduler API (http backend)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-request timeout in seconds (http backend)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long each simulated job runs before its elements finish
    #[serde(default = "default_simulated_runtime")]
    pub simulated_runtime_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: default_scheduler_kind(),
            endpoint: None,
            request_timeout_secs: default_request_timeout(),
            simulated_runtime_secs: default_simulated_runtime(),
        }
    }
}

/// Where work items come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkSourceConfig {
    /// Generate a random number of item ids in `[min_items, max_items)`
    Random {
        #[serde(default = "default_min_items")]
        min_items: usize,
        #[serde(default = "default_max_items")]
        max_items: usize,
    },
    /// Read newline-delimited item ids from a path in shared storage
    Manifest { path: String },
}

impl Default for WorkSourceConfig {
    fn default() -> Self {
        Self::Random {
            min_items: default_min_items(),
            max_items: default_max_items(),
        }
    }
}

/// Work partitioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Upper bound on array size (nodes per stage)
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Minimum items per node before another node is added
    #[serde(default = "default_node_task_limit")]
    pub node_task_limit: usize,

    /// Work item source
    #[serde(default)]
    pub work_source: WorkSourceConfig,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
            node_task_limit: default_node_task_limit(),
            work_source: WorkSourceConfig::default(),
        }
    }
}

/// One pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Job name used for submission and logs
    pub name: String,

    /// Executable reference (job definition) run by every element
    pub job_definition: String,

    /// Queue the array job is submitted to
    pub job_queue: String,

    /// How this stage waits on the previous one
    #[serde(default)]
    pub dependency_type: DependencyType,

    /// Extra environment passed to every element
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Destination for final output (egress stage)
    #[serde(default)]
    pub egress_destination: Option<String>,

    /// Variable carrying the run id to every element
    #[serde(default = "default_run_id_env")]
    pub run_id_env: String,

    /// Variable carrying `egress_destination` to every element
    #[serde(default = "default_results_destination_env")]
    pub results_destination_env: String,
}

/// Completion polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Pause between poll attempts in seconds
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Give up on a run after this many seconds (None = poll forever)
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: Option<u64>,

    /// Retry configuration for run-state storage writes
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            timeout_secs: default_poll_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

/// Run outcome policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Mark the run FAILED instead of DONE when any element failed
    #[serde(default)]
    pub fail_on_element_failure: bool,
}

/// Fixed-schedule trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between run triggers
    #[serde(default = "default_schedule_interval")]
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_schedule_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.storage.local_path, &self.storage.bucket, &self.storage.prefix) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                anyhow::bail!("Cannot specify both local_path and bucket/prefix");
            }
            (None, None, _) | (None, _, None) => {
                anyhow::bail!("Must specify either local_path or both bucket and prefix");
            }
            _ => {}
        }

        if self.scheduler.kind == SchedulerKind::Http && self.scheduler.endpoint.is_none() {
            anyhow::bail!("The http scheduler requires an endpoint");
        }

        if self.partition.max_nodes == 0 {
            anyhow::bail!("max_nodes must be > 0");
        }
        if self.partition.node_task_limit == 0 {
            anyhow::bail!("node_task_limit must be > 0");
        }
        if let WorkSourceConfig::Random { min_items, max_items } = self.partition.work_source {
            if min_items == 0 || min_items >= max_items {
                anyhow::bail!("Random work source needs 0 < min_items < max_items");
            }
        }

        if self.stages.len() != PIPELINE_STAGES {
            anyhow::bail!(
                "Expected exactly {} stages, found {}",
                PIPELINE_STAGES,
                self.stages.len()
            );
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() || stage.job_definition.is_empty() || stage.job_queue.is_empty() {
                anyhow::bail!("Stage {} needs a name, job_definition and job_queue", i + 1);
            }
            if stage.run_id_env.is_empty() || stage.results_destination_env.is_empty() {
                anyhow::bail!("Stage {} has an empty environment variable name", i + 1);
            }
        }

        if self.poll.interval_secs == 0 {
            anyhow::bail!("Poll interval must be > 0");
        }
        if self.schedule.interval_secs == 0 {
            anyhow::bail!("Schedule interval must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_region() -> String { "us-east-1".to_string() }
fn default_scheduler_kind() -> SchedulerKind { SchedulerKind::Http }
fn default_request_timeout() -> u64 { 10 }
fn default_simulated_runtime() -> u64 { 60 }
fn default_min_items() -> usize { 20 }
fn default_max_items() -> usize { 50 }
fn default_max_nodes() -> usize { 10_000 }
fn default_node_task_limit() -> usize { 5 }
fn default_poll_interval() -> u64 { 30 }
fn default_poll_timeout() -> Option<u64> { Some(86_400) }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }
fn default_schedule_interval() -> u64 { 86_400 }
fn default_run_id_env() -> String { RUN_ID_ENV.to_string() }
fn default_results_destination_env() -> String { RESULTS_DESTINATION_ENV.to_string() }
