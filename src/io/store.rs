//! Object store configuration for shared run storage.
//!
//! Partitions, intermediate element data and run-state records all live in
//! one store: a local (mounted) filesystem or an S3 bucket under a prefix.

use crate::config::Config;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::prefix::PrefixStore;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Client options for the run-state store.
///
/// Requests are small JSON/CSV objects, so timeouts are short and the pool
/// stays modest.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(30))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(16)
}

/// Retry configuration for transient S3 failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 store rooted at `prefix`.
///
/// Credentials are loaded from the environment, AWS config files or the
/// instance profile, in that order.
fn create_s3_store(bucket: &str, prefix: &str, config: &Config) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for s3://{}/{}", bucket, prefix);

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(&config.aws.region)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    if let Some(endpoint) = &config.aws.endpoint_url {
        builder = builder.with_endpoint(endpoint).with_allow_http(true);
    }

    let s3 = builder.build()?;
    Ok(Arc::new(PrefixStore::new(s3, prefix)))
}

/// Create the shared store described by the storage config.
/// Uses LocalFileSystem if local_path is set, otherwise S3 with credentials.
pub fn create_shared_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let storage = &config.storage;
    match (&storage.local_path, &storage.bucket, &storage.prefix) {
        (Some(local_path), _, _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (_, Some(bucket), Some(prefix)) => create_s3_store(bucket, prefix, config),
        _ => anyhow::bail!("Invalid config: no storage destination"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{tests::test_config, StorageConfig};
    use tempfile::TempDir;

    #[test]
    fn test_create_local_store() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("batch");
        let config = test_config(root.to_str().unwrap());

        assert!(create_shared_store(&config).is_ok());
        assert!(root.exists());
    }

    #[test]
    fn test_create_s3_store() {
        let mut config = test_config("unused");
        config.storage = StorageConfig {
            local_path: None,
            bucket: Some("test-bucket".to_string()),
            prefix: Some("batch".to_string()),
        };
        assert!(create_shared_store(&config).is_ok());
    }
}
