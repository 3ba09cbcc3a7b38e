//! # Stratus Store
//!
//! Remote storage collaborators for the Stratus cloud environment.
//!
//! This crate provides:
//! - **ObjectStore**: bucket/key blob storage with ranged reads, paged listing and copy
//! - **LogStream**: an append-only, partitioned record log read from a cursor forward
//! - **Memory backends**: in-process implementations for tests and embedding
//! - **FsObjectStore**: a directory-backed object store for single-host deployments
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Cloud Environment Layer        │
//! ├────────────────────┬────────────────────┤
//! │  ObjectStore Trait │  LogStream Trait   │
//! ├──────────┬─────────┼────────────────────┤
//! │  Memory  │   Fs    │      Memory        │
//! └──────────┴─────────┴────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! A point read issued after a successful put always observes the put.
//! Listings may lag behind writes; callers that need read-after-write
//! existence checks must probe with a zero-length `get_range`.

pub mod error;
pub mod fs;
pub mod log;
pub mod memory;

pub use error::{Result, StoreError};
pub use fs::FsObjectStore;
pub use log::MemoryLogStream;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Default page size for object listings
pub const DEFAULT_LIST_PAGE_SIZE: usize = 50;

/// Metadata describing one stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Bucket holding the object
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Total size in bytes
    pub size: u64,
    /// Time of the last put or copy
    pub last_modified: DateTime<Utc>,
}

/// Upload options for a put
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Ask the store to encrypt the object at rest
    pub server_side_encryption: bool,
    /// Key to encrypt with; the store's default key when absent
    pub encryption_key_id: Option<String>,
}

impl PutOptions {
    /// Whether these options describe a plain put
    pub fn is_plain(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of a ranged read
#[derive(Clone, Debug)]
pub struct ObjectRange {
    /// Bytes served, possibly shorter than requested at the end of the object
    pub data: Bytes,
    /// Metadata of the whole object
    pub object: ObjectMeta,
}

/// One page of a key listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in lexicographic order
    pub keys: Vec<String>,
    /// More keys remain after this page
    pub is_truncated: bool,
    /// Marker to pass to the next call when truncated
    pub next_marker: Option<String>,
}

/// Trait for object storage backends
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create a bucket; succeeds if it already exists
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Store an object, replacing any previous version
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<ObjectMeta>;

    /// Store an object with upload options
    ///
    /// Backends without server-side encryption store the bytes as given.
    async fn put_object_with(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        _options: &PutOptions,
    ) -> Result<ObjectMeta> {
        self.put_object(bucket, key, data).await
    }

    /// Read up to `len` bytes starting at `offset`
    ///
    /// A zero-length read returns the object's metadata and is the cheapest
    /// way to check existence with read-after-write consistency.
    async fn get_range(&self, bucket: &str, key: &str, offset: u64, len: u64)
        -> Result<ObjectRange>;

    /// Delete an object
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// List keys starting with `prefix` that sort strictly after `marker`
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage>;

    /// Copy an object, possibly across buckets
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<ObjectMeta>;
}

/// Position of an appended record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordPosition {
    /// Partition the record landed in
    pub partition: u32,
    /// Sequence number within the partition
    pub sequence: u64,
}

/// A record read back from a log stream
#[derive(Clone, Debug)]
pub struct StreamRecord {
    /// Sequence number within the partition
    pub sequence: u64,
    /// Opaque payload
    pub payload: Bytes,
}

/// Trait for partitioned, append-only log streams
#[async_trait]
pub trait LogStream: Send + Sync {
    /// Create a stream; succeeds if it already exists
    async fn create_stream(&self, stream: &str) -> Result<()>;

    /// List the partitions of a stream
    async fn partitions(&self, stream: &str) -> Result<Vec<u32>>;

    /// Append a record; records sharing a partition key keep their order
    async fn append(&self, stream: &str, partition_key: &str, payload: Bytes)
        -> Result<RecordPosition>;

    /// Read up to `max_records` records with sequence >= `cursor`
    async fn read_from(
        &self,
        stream: &str,
        partition: u32,
        cursor: u64,
        max_records: usize,
    ) -> Result<Vec<StreamRecord>>;
}

/// Collect every key under `prefix`, following truncated pages
pub async fn list_all<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
    prefix: &str,
    page_size: usize,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let page = store
            .list_objects(bucket, prefix, marker.as_deref(), page_size)
            .await?;
        let last = page.keys.last().cloned();
        keys.extend(page.keys);
        if !page.is_truncated {
            break;
        }
        marker = match page.next_marker.or(last) {
            Some(m) => Some(m),
            None => break,
        };
    }
    Ok(keys)
}

/// Slice `len` bytes at `offset` out of a whole object, clamping to its end
pub(crate) fn clamp_range(total: u64, offset: u64, len: u64) -> Option<(usize, usize)> {
    if offset > total {
        return None;
    }
    let end = offset.saturating_add(len).min(total);
    Some((offset as usize, end as usize))
}
