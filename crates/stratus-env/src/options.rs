//! Environment configuration

use crate::error::{EnvError, Result};
use crate::retry::{DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use stratus_store::PutOptions;

/// Prefix prepended to every configured bucket name
pub const DEFAULT_BUCKET_PREFIX: &str = "stratus.";

/// Default grace period before a deleted table file is removed remotely
pub const DEFAULT_FILE_DELETION_DELAY: Duration = Duration::from_secs(60);

/// Default sleep between tailer polls that found nothing
pub const DEFAULT_TAILER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One side (source or destination) of an environment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketOptions {
    /// Bucket name without the configured prefix; empty means "no remote"
    pub bucket: String,
    /// Key prefix of the database inside the bucket
    pub object_path: String,
    /// Region hint for the object store client
    pub region: Option<String>,
}

impl BucketOptions {
    /// Create options for a bucket and object path
    pub fn new(bucket: impl Into<String>, object_path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object_path: object_path.into(),
            region: None,
        }
    }

    /// Read `<PREFIX>_BUCKET_NAME`, `<PREFIX>_OBJECT_PATH` and `<PREFIX>_REGION`
    pub fn from_environment(prefix: &str) -> Self {
        let var = |name: &str| std::env::var(format!("{}_{}", prefix, name)).ok();
        Self {
            bucket: var("BUCKET_NAME").unwrap_or_default(),
            object_path: var("OBJECT_PATH").unwrap_or_default(),
            region: var("REGION"),
        }
    }

    /// Set the region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Whether this side points at a remote location
    pub fn is_enabled(&self) -> bool {
        !self.bucket.is_empty()
    }

    fn validate(&self, side: &str) -> Result<()> {
        if self.bucket.is_empty() != self.object_path.trim_matches('/').is_empty() {
            return Err(EnvError::InvalidArgument(format!(
                "{} bucket name and object path must both be set or both be empty \
                 (bucket: {:?}, object path: {:?})",
                side, self.bucket, self.object_path
            )));
        }
        Ok(())
    }
}

/// A resolved remote location: full bucket name plus normalized key prefix
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteLocation {
    /// Bucket name including the configured prefix
    pub bucket: String,
    /// Key prefix without leading or trailing separators
    pub prefix: String,
}

impl RemoteLocation {
    /// Create a location from a full bucket name and a key prefix
    pub fn new(bucket: impl Into<String>, prefix: &str) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Object key for a file name under this location
    pub fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Key prefix that lists every file under this location
    pub fn listing_prefix(&self) -> String {
        self.key("")
    }

    /// Key of the zero-byte directory marker
    pub fn marker_key(&self) -> String {
        self.prefix.clone()
    }
}

impl std::fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.prefix)
    }
}

/// Options of a cloud environment
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudEnvOptions {
    /// Where existing data is read from
    pub src: BucketOptions,
    /// Where new data is written; empty makes a local-only fork
    pub dest: BucketOptions,
    /// Prefix prepended to bucket names
    pub bucket_prefix: String,
    /// Keep a local replica of every table file and serve reads from it
    pub keep_local_sst_files: bool,
    /// Keep log segments on local disk instead of the log stream
    pub keep_local_log_files: bool,
    /// Log stream that carries log segments when they are not kept locally
    pub log_stream: Option<String>,
    /// Root of the tailer's cache directories
    pub log_cache_dir: Option<PathBuf>,
    /// Budget of one retried operation
    #[serde(with = "millis")]
    pub retry_timeout: Duration,
    /// Delay between retry attempts
    #[serde(with = "millis")]
    pub retry_interval: Duration,
    /// Grace period before a deleted table file is removed
    #[serde(with = "millis")]
    pub file_deletion_delay: Duration,
    /// Sleep between tailer polls that found no records
    #[serde(with = "millis")]
    pub tailer_poll_interval: Duration,
    /// Compare local and remote sizes of table files
    pub validate_file_size: bool,
    /// Create the destination bucket on open
    pub create_bucket_if_missing: bool,
    /// Fetch missing live table files into the local directory on open
    pub hydrate_on_open: bool,
    /// Page size of remote listings
    pub list_page_size: usize,
    /// Ask the object store to encrypt table files at rest
    pub server_side_encryption: bool,
    /// Key used for server-side encryption; the store's default when absent
    pub encryption_key_id: Option<String>,
}

impl Default for CloudEnvOptions {
    fn default() -> Self {
        Self {
            src: BucketOptions::default(),
            dest: BucketOptions::default(),
            bucket_prefix: DEFAULT_BUCKET_PREFIX.to_string(),
            keep_local_sst_files: false,
            keep_local_log_files: true,
            log_stream: None,
            log_cache_dir: None,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            file_deletion_delay: DEFAULT_FILE_DELETION_DELAY,
            tailer_poll_interval: DEFAULT_TAILER_POLL_INTERVAL,
            validate_file_size: true,
            create_bucket_if_missing: true,
            hydrate_on_open: true,
            list_page_size: stratus_store::DEFAULT_LIST_PAGE_SIZE,
            server_side_encryption: false,
            encryption_key_id: None,
        }
    }
}

impl CloudEnvOptions {
    /// Options for a database that reads and writes the same location
    pub fn new(bucket: impl Into<String>, object_path: impl Into<String>) -> Self {
        let side = BucketOptions::new(bucket, object_path);
        Self {
            src: side.clone(),
            dest: side,
            ..Default::default()
        }
    }

    /// Set the source location
    pub fn with_src(mut self, src: BucketOptions) -> Self {
        self.src = src;
        self
    }

    /// Set the destination location
    pub fn with_dest(mut self, dest: BucketOptions) -> Self {
        self.dest = dest;
        self
    }

    /// Set the bucket prefix
    pub fn with_bucket_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bucket_prefix = prefix.into();
        self
    }

    /// Keep local replicas of table files
    pub fn with_keep_local_sst_files(mut self, keep: bool) -> Self {
        self.keep_local_sst_files = keep;
        self
    }

    /// Route log segments through a log stream
    pub fn with_log_stream(mut self, stream: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        self.log_stream = Some(stream.into());
        self.log_cache_dir = Some(cache_dir.into());
        self.keep_local_log_files = false;
        self
    }

    /// Set the retry budget and interval
    pub fn with_retry(mut self, timeout: Duration, interval: Duration) -> Self {
        self.retry_timeout = timeout;
        self.retry_interval = interval;
        self
    }

    /// Set the deletion grace period
    pub fn with_file_deletion_delay(mut self, delay: Duration) -> Self {
        self.file_deletion_delay = delay;
        self
    }

    /// Set the tailer poll interval
    pub fn with_tailer_poll_interval(mut self, interval: Duration) -> Self {
        self.tailer_poll_interval = interval;
        self
    }

    /// Encrypt table files at rest, optionally under a specific key
    pub fn with_server_side_encryption(mut self, key_id: Option<String>) -> Self {
        self.server_side_encryption = true;
        self.encryption_key_id = key_id;
        self
    }

    /// Upload options for table files
    pub fn put_options(&self) -> PutOptions {
        PutOptions {
            server_side_encryption: self.server_side_encryption,
            encryption_key_id: self.encryption_key_id.clone(),
        }
    }

    /// Resolved source location, if any
    pub fn src_location(&self) -> Option<RemoteLocation> {
        self.location(&self.src)
    }

    /// Resolved destination location, if any
    pub fn dest_location(&self) -> Option<RemoteLocation> {
        self.location(&self.dest)
    }

    /// Full bucket name for a configured one
    pub fn resolve_bucket(&self, bucket: &str) -> String {
        format!("{}{}", self.bucket_prefix, bucket)
    }

    fn location(&self, side: &BucketOptions) -> Option<RemoteLocation> {
        side.is_enabled()
            .then(|| RemoteLocation::new(self.resolve_bucket(&side.bucket), &side.object_path))
    }

    /// Reject inconsistent option combinations
    pub fn validate(&self) -> Result<()> {
        self.src.validate("source")?;
        self.dest.validate("destination")?;
        if !self.keep_local_log_files && self.log_stream.is_none() {
            return Err(EnvError::InvalidArgument(
                "log segments must be kept locally when no log stream is configured".into(),
            ));
        }
        if self.retry_interval.is_zero() || self.retry_interval >= self.retry_timeout {
            return Err(EnvError::InvalidArgument(format!(
                "retry interval {:?} must be non-zero and below the timeout {:?}",
                self.retry_interval, self.retry_timeout
            )));
        }
        if self.encryption_key_id.is_some() && !self.server_side_encryption {
            return Err(EnvError::InvalidArgument(
                "an encryption key id requires server-side encryption".into(),
            ));
        }
        if self.list_page_size == 0 {
            return Err(EnvError::InvalidArgument("list page size must be positive".into()));
        }
        Ok(())
    }
}

/// Durations as integer milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
