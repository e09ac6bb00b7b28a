//! Work partitioning.
//!
//! A run's work items are split into equally sized contiguous slices, one per
//! array-job node. The slices are written to shared storage under the run id
//! so each element can find its own slice from nothing but `run_id` and its
//! array index:
//!
//! ```text
//! {run_id}/partitions.json          manifest (ranges per node)
//! {run_id}/{index}/prep/data.csv    item ids of node `index`, one per line
//! {run_id}/{index}/data/...         written by stage 1 elements
//! {run_id}/{index}/results/...      written by stage 2 elements
//! ```

mod element;
mod source;

pub use element::{ElementContext, ARRAY_INDEX_ENV, RESULTS_DESTINATION_ENV, RUN_ID_ENV};
pub use source::{work_source_from_config, FixedWorkSource, ManifestWorkSource, RandomWorkSource, WorkSource};

use crate::error::PartitionError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// Concurrent object writes while laying out partitions.
const WRITE_CONCURRENCY: usize = 16;

/// Location of the partition manifest for a run.
pub fn manifest_path(run_id: &str) -> Path {
    Path::from(format!("{run_id}/partitions.json"))
}

/// Location of the item list for one node.
pub fn partition_items_path(run_id: &str, index: usize) -> Path {
    Path::from(format!("{run_id}/{index}/prep/data.csv"))
}

/// Sizing of a run's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub total_items: usize,
    /// Items per node (the last node may hold fewer)
    pub chunk_size: usize,
    pub total_nodes: usize,
}

impl PartitionPlan {
    /// Size partitions for `total_work_items` items.
    ///
    /// Nodes are filled to at least `node_task_limit` items; once that would
    /// need more than `max_nodes` nodes the chunk grows instead, so
    /// `1 <= total_nodes <= max_nodes` for any positive amount of work.
    pub fn compute(
        total_work_items: i64,
        max_nodes: usize,
        node_task_limit: usize,
    ) -> Result<Self, PartitionError> {
        if total_work_items <= 0 {
            return Err(PartitionError::NoWork {
                total: total_work_items,
            });
        }
        if max_nodes == 0 || node_task_limit == 0 {
            return Err(PartitionError::InvalidBounds {
                reason: format!(
                    "max_nodes ({max_nodes}) and node_task_limit ({node_task_limit}) must be > 0"
                ),
            });
        }

        let total_items = total_work_items as usize;
        let chunk_size = node_task_limit.max(total_items.div_ceil(max_nodes));
        let total_nodes = total_items.div_ceil(chunk_size);

        Ok(Self {
            total_items,
            chunk_size,
            total_nodes,
        })
    }

    /// Item index range owned by `node`.
    pub fn range(&self, node: usize) -> Option<Range<usize>> {
        (node < self.total_nodes).then(|| {
            let start = node * self.chunk_size;
            start..(start + self.chunk_size).min(self.total_items)
        })
    }
}

/// One node's slice in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRange {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

/// Partition assignment persisted for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub plan: PartitionPlan,
    pub nodes: Vec<NodeRange>,
}

/// Output of a successful partitioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitioned {
    /// Freshly allocated run identity
    pub run_id: String,
    pub plan: PartitionPlan,
}

/// Splits work into array-job nodes and records the split in shared storage.
#[derive(Clone)]
pub struct Partitioner {
    store: Arc<dyn ObjectStore>,
    node_task_limit: usize,
}

impl Partitioner {
    pub fn new(store: Arc<dyn ObjectStore>, node_task_limit: usize) -> Self {
        Self {
            store,
            node_task_limit,
        }
    }

    /// Partition `items` into at most `max_nodes` nodes under a new run id.
    ///
    /// Every call allocates a new run identity, so a retry is a new run.
    pub async fn partition(
        &self,
        items: &[String],
        max_nodes: usize,
    ) -> Result<Partitioned, PartitionError> {
        let plan = PartitionPlan::compute(items.len() as i64, max_nodes, self.node_task_limit)?;
        let run_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            "Partitioning {} items into {} nodes of up to {} for run {}",
            plan.total_items,
            plan.total_nodes,
            plan.chunk_size,
            run_id
        );

        let nodes: Vec<NodeRange> = (0..plan.total_nodes)
            .filter_map(|index| {
                plan.range(index).map(|r| NodeRange {
                    index,
                    start: r.start,
                    end: r.end,
                })
            })
            .collect();

        let writes: Vec<(Path, Bytes)> = nodes
            .iter()
            .map(|node| {
                (
                    partition_items_path(&run_id, node.index),
                    Bytes::from(items[node.start..node.end].join("\n")),
                )
            })
            .collect();

        let store = self.store.clone();
        stream::iter(writes)
            .map(move |(path, content)| {
                let store = store.clone();
                async move {
                    store.put(&path, content.into()).await?;
                    Ok::<_, PartitionError>(())
                }
            })
            .buffer_unordered(WRITE_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;

        // Written last, so a manifest implies every node file exists.
        let manifest = PartitionManifest {
            run_id: run_id.clone(),
            created_at: Utc::now(),
            plan,
            nodes,
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        self.store
            .put(&manifest_path(&run_id), Bytes::from(json).into())
            .await?;

        Ok(Partitioned { run_id, plan })
    }
}

/// Load the partition manifest of a run.
pub async fn read_manifest(
    store: &dyn ObjectStore,
    run_id: &str,
) -> Result<PartitionManifest, PartitionError> {
    let bytes = store.get(&manifest_path(run_id)).await?.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Load the item ids assigned to node `index` of a run.
pub async fn read_partition(
    store: &dyn ObjectStore,
    run_id: &str,
    index: usize,
) -> Result<Vec<String>, PartitionError> {
    let bytes = store
        .get(&partition_items_path(run_id, index))
        .await?
        .bytes()
        .await?;
    let content = String::from_utf8_lossy(&bytes);
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
