//! Fixed-schedule trigger.
//!
//! Starts a new run every interval. Runs are not coordinated with each other:
//! each gets its own run id and storage namespace and is driven on its own
//! task, so a slow run never delays the next trigger.

use super::orchestrator::Orchestrator;
use super::state::RunState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

/// Fires runs on a fixed interval until shut down.
pub struct Trigger {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl Trigger {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Trigger runs until `shutdown` fires or its sender is dropped.
    ///
    /// The first run starts immediately. Runs still active at shutdown are
    /// cancelled; their persisted records can be resumed later.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> TriggerStats {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut runs = JoinSet::new();
        let mut stats = TriggerStats::default();

        tracing::info!("Triggering a run every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    stats.runs_triggered += 1;
                    let orchestrator = self.orchestrator.clone();
                    runs.spawn(async move { orchestrator.run().await });
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    match joined {
                        Ok(Ok(record)) if record.state == RunState::Done => stats.runs_succeeded += 1,
                        Ok(Ok(_)) => stats.runs_failed += 1,
                        Ok(Err(e)) => {
                            tracing::error!("Run could not be driven: {}", e);
                            stats.runs_failed += 1;
                        }
                        Err(e) => {
                            tracing::error!("Run task failed: {}", e);
                            stats.runs_failed += 1;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }

        stats.runs_interrupted = runs.len();
        if stats.runs_interrupted > 0 {
            tracing::warn!(
                "Stopping {} active runs; resume them from their persisted state",
                stats.runs_interrupted
            );
        }
        runs.shutdown().await;

        stats
    }
}

/// Statistics from a trigger session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TriggerStats {
    pub runs_triggered: usize,
    /// Runs ending in DONE
    pub runs_succeeded: usize,
    /// Runs ending in any other terminal state, or erroring out
    pub runs_failed: usize,
    /// Runs still active at shutdown
    pub runs_interrupted: usize,
}

impl std::fmt::Display for TriggerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Triggered: {}, Succeeded: {}, Failed: {}, Interrupted: {}",
            self.runs_triggered, self.runs_succeeded, self.runs_failed, self.runs_interrupted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::partition::FixedWorkSource;
    use crate::scheduler::SimulatedScheduler;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;

    fn orchestrator(runtime_secs: u64) -> Arc<Orchestrator> {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let scheduler = Arc::new(SimulatedScheduler::new(Duration::from_secs(runtime_secs)));
        Arc::new(
            Orchestrator::new(Arc::new(test_config("unused")), store, scheduler)
                .with_work_source(Arc::new(FixedWorkSource { count: 12 })),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_fire_on_interval() {
        // Each run is done by its second poll, 30s after it starts
        let orchestrator = orchestrator(5);
        let trigger = Trigger::new(orchestrator.clone(), Duration::from_secs(100));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(trigger.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(250)).await;
        shutdown_tx.send(()).await.unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(
            stats,
            TriggerStats {
                runs_triggered: 3,
                runs_succeeded: 3,
                runs_failed: 0,
                runs_interrupted: 0,
            }
        );

        // Every run got its own identity
        assert_eq!(orchestrator.runs().list().await.unwrap().len(), 3);
        assert_eq!(orchestrator.metrics().snapshot().runs_completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_active_runs() {
        let orchestrator = orchestrator(1000);
        let trigger = Trigger::new(orchestrator.clone(), Duration::from_secs(3600));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(trigger.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(shutdown_tx);
        let stats = handle.await.unwrap();

        assert_eq!(stats.runs_triggered, 1);
        assert_eq!(stats.runs_interrupted, 1);

        // The interrupted run is left resumable
        let run_ids = orchestrator.runs().list().await.unwrap();
        let record = orchestrator.status(&run_ids[0]).await.unwrap();
        assert_eq!(record.state, RunState::WaitAndRetryPoll);
    }
}
