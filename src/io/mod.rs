//! Shared storage: object store construction and persisted run records.

mod run_store;
mod store;

pub use run_store::RunStore;
pub use store::create_shared_store;
