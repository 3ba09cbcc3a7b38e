//! In-memory object store for testing and embedding

use crate::{
    clamp_range, ListPage, ObjectMeta, ObjectRange, ObjectStore, PutOptions, Result, StoreError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
    written_at: Instant,
    encryption: Option<PutOptions>,
}

/// An in-memory object store
///
/// Point reads are immediately consistent. Listings can be configured to lag
/// behind writes with [`MemoryObjectStore::with_list_delay`], and transient
/// failures can be injected with [`MemoryObjectStore::fail_next`].
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    buckets: Arc<DashMap<String, BTreeMap<String, StoredObject>>>,
    list_delay: Arc<RwLock<Duration>>,
    pending_failures: Arc<AtomicUsize>,
}

impl MemoryObjectStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide objects from listings until they are at least `delay` old
    pub fn with_list_delay(self, delay: Duration) -> Self {
        *self.list_delay.write() = delay;
        self
    }

    /// Change the listing delay on a live store
    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.write() = delay;
    }

    /// Make the next `count` calls fail with a transient error
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of objects in a bucket
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.get(bucket).map(|b| b.len()).unwrap_or(0)
    }

    /// All keys of a bucket, ignoring the listing delay
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Encryption options an object was uploaded with, if any
    pub fn encryption(&self, bucket: &str, key: &str) -> Option<PutOptions> {
        self.buckets
            .get(bucket)
            .and_then(|b| b.get(key).and_then(|o| o.encryption.clone()))
    }

    fn inject_fault(&self) -> Result<()> {
        let taken = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn meta(bucket: &str, key: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: object.last_modified,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.inject_fault()?;
        self.buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<ObjectMeta> {
        self.put_object_with(bucket, key, data, &PutOptions::default())
            .await
    }

    async fn put_object_with(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> Result<ObjectMeta> {
        self.inject_fault()?;
        let mut objects = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        let object = StoredObject {
            data,
            last_modified: Utc::now(),
            written_at: Instant::now(),
            encryption: (!options.is_plain()).then(|| options.clone()),
        };
        let meta = Self::meta(bucket, key, &object);
        objects.insert(key.to_string(), object);
        Ok(meta)
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<ObjectRange> {
        self.inject_fault()?;
        let objects = self
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        let object = objects
            .get(key)
            .ok_or_else(|| StoreError::no_such_key(bucket, key))?;
        let total = object.data.len() as u64;
        let (start, end) = clamp_range(total, offset, len)
            .ok_or(StoreError::InvalidRange { offset, size: total })?;
        Ok(ObjectRange {
            data: object.data.slice(start..end),
            object: Self::meta(bucket, key, object),
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.inject_fault()?;
        let mut objects = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::no_such_key(bucket, key))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        self.inject_fault()?;
        let delay = *self.list_delay.read();
        let objects = self
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;

        let lower = match marker {
            Some(m) if m >= prefix => Bound::Excluded(m.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };
        let mut visible = objects
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, o)| o.written_at.elapsed() >= delay)
            .map(|(k, _)| k.clone());

        let max_keys = max_keys.max(1);
        let keys: Vec<String> = visible.by_ref().take(max_keys).collect();
        let is_truncated = visible.next().is_some();
        let next_marker = if is_truncated { keys.last().cloned() } else { None };
        Ok(ListPage {
            keys,
            is_truncated,
            next_marker,
        })
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<ObjectMeta> {
        self.inject_fault()?;
        let (data, encryption) = {
            let objects = self
                .buckets
                .get(src_bucket)
                .ok_or_else(|| StoreError::NoSuchBucket(src_bucket.to_string()))?;
            objects
                .get(src_key)
                .map(|o| (o.data.clone(), o.encryption.clone()))
                .ok_or_else(|| StoreError::no_such_key(src_bucket, src_key))?
        };
        let mut objects = self
            .buckets
            .get_mut(dst_bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(dst_bucket.to_string()))?;
        let object = StoredObject {
            data,
            last_modified: Utc::now(),
            written_at: Instant::now(),
            encryption,
        };
        let meta = Self::meta(dst_bucket, dst_key, &object);
        objects.insert(dst_key.to_string(), object);
        Ok(meta)
    }
}
