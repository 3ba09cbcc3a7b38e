//! Error types for the stratus-store crate

use thiserror::Error;

/// Result type alias using `StoreError`
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by the object store and log stream backends
#[derive(Error, Debug)]
pub enum StoreError {
    /// Object not found
    #[error("object not found: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    /// Bucket not found
    #[error("bucket not found: {0}")]
    NoSuchBucket(String),

    /// Log stream not found
    #[error("log stream not found: {0}")]
    NoSuchStream(String),

    /// Partition not found on an existing stream
    #[error("partition {partition} not found on stream {stream}")]
    NoSuchPartition { stream: String, partition: u32 },

    /// Requested range cannot be served
    #[error("invalid range: offset {offset} exceeds object size {size}")]
    InvalidRange { offset: u64, size: u64 },

    /// The backend could not serve the request right now
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Shorthand for a missing object
    pub fn no_such_key(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NoSuchKey {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Whether the error means the addressed thing does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NoSuchKey { .. }
            | Self::NoSuchBucket(_)
            | Self::NoSuchStream(_)
            | Self::NoSuchPartition { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
