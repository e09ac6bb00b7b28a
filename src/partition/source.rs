//! Where a run's work items come from.

use crate::config::WorkSourceConfig;
use crate::error::PartitionError;
use async_trait::async_trait;
use object_store::path::Path;
use object_store::ObjectStore;
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

/// Produces the work item ids for a new run.
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn work_items(&self) -> Result<Vec<String>, PartitionError>;
}

fn generate_ids(count: usize) -> Vec<String> {
    (0..count).map(|_| Uuid::new_v4().to_string()).collect()
}

/// A random number of generated ids in `[min_items, max_items)`.
pub struct RandomWorkSource {
    pub min_items: usize,
    pub max_items: usize,
}

#[async_trait]
impl WorkSource for RandomWorkSource {
    async fn work_items(&self) -> Result<Vec<String>, PartitionError> {
        if self.min_items >= self.max_items {
            return Err(PartitionError::Source {
                reason: format!("empty range {}..{}", self.min_items, self.max_items),
            });
        }
        let count = rand::thread_rng().gen_range(self.min_items..self.max_items);
        Ok(generate_ids(count))
    }
}

/// Exactly `count` generated ids.
pub struct FixedWorkSource {
    pub count: usize,
}

#[async_trait]
impl WorkSource for FixedWorkSource {
    async fn work_items(&self) -> Result<Vec<String>, PartitionError> {
        Ok(generate_ids(self.count))
    }
}

/// Newline-delimited ids read from shared storage.
pub struct ManifestWorkSource {
    store: Arc<dyn ObjectStore>,
    path: Path,
}

impl ManifestWorkSource {
    pub fn new(store: Arc<dyn ObjectStore>, path: &str) -> Self {
        Self {
            store,
            path: Path::from(path),
        }
    }
}

#[async_trait]
impl WorkSource for ManifestWorkSource {
    async fn work_items(&self) -> Result<Vec<String>, PartitionError> {
        let bytes = self.store.get(&self.path).await?.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Build the configured work source.
pub fn work_source_from_config(
    config: &WorkSourceConfig,
    store: Arc<dyn ObjectStore>,
) -> Arc<dyn WorkSource> {
    match config {
        WorkSourceConfig::Random { min_items, max_items } => Arc::new(RandomWorkSource {
            min_items: *min_items,
            max_items: *max_items,
        }),
        WorkSourceConfig::Manifest { path } => Arc::new(ManifestWorkSource::new(store, path)),
    }
}
