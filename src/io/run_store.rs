//! Durable run-state records.
//!
//! The orchestrator's state lives in shared storage rather than in process
//! memory, so a wait between polls survives a restart:
//!
//! ```text
//! runs/{run_id}/state.json   the RunRecord, rewritten after every transition
//! runs/{run_id}/abort        abort marker, written by an operator
//! ```

use crate::config::RetryConfig;
use crate::error::OrchestratorError;
use crate::pipeline::RunRecord;
use bytes::Bytes;
use futures::stream::StreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const RUNS_PREFIX: &str = "runs";

fn state_path(run_id: &str) -> Path {
    Path::from(format!("{RUNS_PREFIX}/{run_id}/state.json"))
}

fn abort_path(run_id: &str) -> Path {
    Path::from(format!("{RUNS_PREFIX}/{run_id}/abort"))
}

/// Reads and writes run records in shared storage.
#[derive(Clone)]
pub struct RunStore {
    store: Arc<dyn ObjectStore>,
    retry: RetryConfig,
}

impl RunStore {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Persist `record`, retrying transient storage failures with backoff.
    pub async fn save(&self, record: &RunRecord) -> Result<(), OrchestratorError> {
        let json = Bytes::from(serde_json::to_vec_pretty(record)?);
        let path = state_path(&record.run_id);

        let mut attempt = 0;
        let mut backoff = self.retry.initial_backoff_ms;

        loop {
            match self.store.put(&path, json.clone().into()).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry.max_retries {
                        tracing::error!(
                            "Saving run {} failed after {} attempts: {}",
                            record.run_id,
                            attempt,
                            e
                        );
                        return Err(e.into());
                    }

                    tracing::warn!(
                        "Saving run {} attempt {} failed: {}, retrying in {}ms",
                        record.run_id,
                        attempt,
                        e,
                        backoff
                    );

                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff_ms);
                }
            }
        }
    }

    /// Load the record of `run_id`.
    pub async fn load(&self, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        let result = match self.store.get(&state_path(run_id)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(OrchestratorError::RunNotFound {
                    run_id: run_id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let bytes = result.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Ids of every run with a persisted record.
    pub async fn list(&self) -> Result<Vec<String>, OrchestratorError> {
        let prefix = Path::from(RUNS_PREFIX);
        let mut listing = self.store.list(Some(&prefix));
        let mut run_ids = BTreeSet::new();

        while let Some(meta) = listing.next().await {
            let meta = meta?;
            let mut parts = meta.location.parts().skip(1);
            if let (Some(run_id), Some(file)) = (parts.next(), parts.next()) {
                if file.as_ref() == "state.json" {
                    run_ids.insert(run_id.as_ref().to_string());
                }
            }
        }
        Ok(run_ids.into_iter().collect())
    }

    /// Ask the orchestrator driving `run_id` to stop.
    pub async fn request_abort(&self, run_id: &str) -> Result<(), OrchestratorError> {
        // Fails with RunNotFound for unknown runs
        self.load(run_id).await?;
        self.store
            .put(&abort_path(run_id), Bytes::from_static(b"abort").into())
            .await?;
        Ok(())
    }

    /// Whether an abort was requested for `run_id`.
    pub async fn abort_requested(&self, run_id: &str) -> Result<bool, OrchestratorError> {
        match self.store.head(&abort_path(run_id)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
