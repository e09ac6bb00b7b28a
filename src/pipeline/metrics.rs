//! Run counters and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by every run an orchestrator drives.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Runs that got past partitioning
    pub runs_started: AtomicU64,

    /// Runs ending in DONE
    pub runs_completed: AtomicU64,

    /// Runs ending in FAILED, ABORTED or TIMED_OUT
    pub runs_failed: AtomicU64,

    /// Array jobs accepted by the scheduler
    pub stages_submitted: AtomicU64,

    /// Work items partitioned
    pub items_partitioned: AtomicU64,

    /// Poll attempts
    pub polls: AtomicU64,

    /// Poll attempts that errored
    pub poll_errors: AtomicU64,

    /// Elements reported FAILED by finished runs
    pub failed_elements: AtomicU64,

    /// Start time
    start_time: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Self::default()
        })
    }

    pub fn add_run_started(&self, items: usize) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        self.items_partitioned.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn add_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_run_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_submitted(&self) {
        self.stages_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one poll attempt and whether it errored.
    pub fn add_poll(&self, errored: bool) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if errored {
            self.poll_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_failed_elements(&self, count: usize) {
        self.failed_elements.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            stages_submitted: self.stages_submitted.load(Ordering::Relaxed),
            items_partitioned: self.items_partitioned.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            failed_elements: self.failed_elements.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();

        println!("\n=== Orchestrator Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Runs started: {}", snapshot.runs_started);
        println!("Runs completed: {}", snapshot.runs_completed);
        println!("Runs failed: {}", snapshot.runs_failed);
        println!("Items partitioned: {}", snapshot.items_partitioned);
        println!("Stages submitted: {}", snapshot.stages_submitted);
        println!("Polls: {} ({} errored)", snapshot.polls, snapshot.poll_errors);
        println!("Failed elements: {}", snapshot.failed_elements);
        println!("============================\n");
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub stages_submitted: u64,
    pub items_partitioned: u64,
    pub polls: u64,
    pub poll_errors: u64,
    pub failed_elements: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Runs: {} started, {} done, {} failed | Stages: {} | \
             Polls: {} ({} errors) | Failed elements: {} | Elapsed: {:.1}s",
            self.runs_started,
            self.runs_completed,
            self.runs_failed,
            self.stages_submitted,
            self.polls,
            self.poll_errors,
            self.failed_elements,
            self.elapsed.as_secs_f64(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_run_started(23);
        metrics.add_run_started(40);
        metrics.add_stage_submitted();

        assert_eq!(metrics.runs_started.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.items_partitioned.load(Ordering::Relaxed), 63);
        assert_eq!(metrics.stages_submitted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_poll_counters() {
        let metrics = Metrics::new();

        metrics.add_poll(false);
        metrics.add_poll(true);
        metrics.add_poll(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.polls, 3);
        assert_eq!(snapshot.poll_errors, 1);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        metrics.add_run_failed();
        metrics.add_failed_elements(2);

        let text = metrics.snapshot().to_string();
        assert!(text.contains("1 failed"));
        assert!(text.contains("Failed elements: 2"));
    }

    #[test]
    fn test_save_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metrics.json");

        let metrics = Metrics::new();
        metrics.add_run_completed();
        metrics.snapshot().save_to_file(path.to_str().unwrap()).unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["runs_completed"], 1);
        assert!(saved["elapsed"].is_f64());
    }
}
