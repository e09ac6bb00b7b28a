//! Element-side view of a run.
//!
//! Array-job elements get no coordination channel besides their environment.
//! `RUN_ID` names the run namespace and the scheduler supplies the element's
//! own array index; together they locate the element's slice.

use super::{partition_items_path, read_partition};
use crate::error::PartitionError;
use anyhow::Context;
use object_store::path::Path;
use object_store::ObjectStore;

/// Default variable carrying the run id to every element.
pub const RUN_ID_ENV: &str = "RUN_ID";

/// Environment variable the scheduler sets to the element's array index.
pub const ARRAY_INDEX_ENV: &str = "AWS_BATCH_JOB_ARRAY_INDEX";

/// Default variable carrying the egress destination.
pub const RESULTS_DESTINATION_ENV: &str = "RESULTS_DESTINATION";

/// Identity of one running array element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementContext {
    pub run_id: String,
    pub array_index: usize,
    pub results_destination: Option<String>,
}

impl ElementContext {
    /// Read the element context from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the context from an arbitrary variable lookup.
    ///
    /// A missing array index means a plain (non-array) job, i.e. index 0.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let run_id = lookup(RUN_ID_ENV)
            .filter(|id| !id.is_empty())
            .with_context(|| format!("{} is not set", RUN_ID_ENV))?;
        let array_index = match lookup(ARRAY_INDEX_ENV) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("{} is not an index: '{}'", ARRAY_INDEX_ENV, raw))?,
            None => 0,
        };

        Ok(Self {
            run_id,
            array_index,
            results_destination: lookup(RESULTS_DESTINATION_ENV),
        })
    }

    /// Item list written by the partitioner for this element.
    pub fn partition_path(&self) -> Path {
        partition_items_path(&self.run_id, self.array_index)
    }

    /// Directory for this element's first-stage output.
    pub fn data_dir(&self) -> Path {
        Path::from(format!("{}/{}/data", self.run_id, self.array_index))
    }

    /// Directory for this element's second-stage output.
    pub fn results_dir(&self) -> Path {
        Path::from(format!("{}/{}/results", self.run_id, self.array_index))
    }

    /// Load the item ids assigned to this element.
    pub async fn work_items(&self, store: &dyn ObjectStore) -> Result<Vec<String>, PartitionError> {
        read_partition(store, &self.run_id, self.array_index).await
    }
}
