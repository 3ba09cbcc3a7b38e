//! Admin tool configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stratus_env::options::DEFAULT_BUCKET_PREFIX;
use stratus_env::retry::{DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_TIMEOUT};
use stratus_env::RetryExecutor;

/// Settings shared by every subcommand
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Root directory of the filesystem object store
    pub store_root: Option<PathBuf>,
    /// Bucket to operate on, without the prefix
    pub bucket: Option<String>,
    /// Prefix prepended to bucket names
    pub bucket_prefix: String,
    /// Retry budget in milliseconds
    pub retry_timeout_ms: u64,
    /// Delay between retries in milliseconds
    pub retry_interval_ms: u64,
    /// Page size of remote listings
    pub list_page_size: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            store_root: None,
            bucket: None,
            bucket_prefix: DEFAULT_BUCKET_PREFIX.to_string(),
            retry_timeout_ms: DEFAULT_RETRY_TIMEOUT.as_millis() as u64,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            list_page_size: stratus_store::DEFAULT_LIST_PAGE_SIZE,
        }
    }
}

impl AdminConfig {
    /// Load from an optional file layered under `STRATUS__*` environment variables
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file));
        }
        builder = builder.add_source(config::Environment::with_prefix("STRATUS").separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Full name of a bucket
    pub fn resolve_bucket(&self, bucket: &str) -> String {
        format!("{}{}", self.bucket_prefix, bucket)
    }

    /// The configured bucket, prefixed
    pub fn bucket(&self) -> anyhow::Result<String> {
        let bucket = self
            .bucket
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no bucket configured; pass --bucket"))?;
        Ok(self.resolve_bucket(bucket))
    }

    /// Retry executor for remote calls
    pub fn retry(&self) -> RetryExecutor {
        RetryExecutor::new(
            Duration::from_millis(self.retry_timeout_ms),
            Duration::from_millis(self.retry_interval_ms),
        )
    }
}
