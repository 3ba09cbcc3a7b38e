//! Directory-backed object store
//!
//! Each bucket is a directory under the store root and each object is one
//! file whose name is the percent-encoded key. Keys are kept flat on disk so
//! that a marker object such as `db` can coexist with keys like `db/000001.sst`.

use crate::{
    clamp_range, ListPage, ObjectMeta, ObjectRange, ObjectStore, Result, StoreError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

const STAGING_PREFIX: &str = "%staging%";

/// An object store rooted at a local directory
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    staging_counter: AtomicU64,
}

impl FsObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            staging_counter: AtomicU64::new(0),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(urlencoding::encode(bucket).as_ref())
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(urlencoding::encode(key).as_ref())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<PathBuf> {
        let dir = self.bucket_dir(bucket);
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => Ok(dir),
            _ => Err(StoreError::NoSuchBucket(bucket.to_string())),
        }
    }

    async fn meta_of(&self, bucket: &str, key: &str, path: &Path) -> Result<ObjectMeta> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::no_such_key(bucket, key)
            } else {
                StoreError::Io(e)
            }
        })?;
        let last_modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(ObjectMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: metadata.len(),
            last_modified,
        })
    }

    /// Write `data` next to the target and rename it into place
    async fn write_atomically(&self, dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
        let n = self.staging_counter.fetch_add(1, Ordering::Relaxed);
        let staging = dir.join(format!("{}{}-{}", STAGING_PREFIX, std::process::id(), n));
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, target).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.bucket_dir(bucket)).await?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<ObjectMeta> {
        let dir = self.ensure_bucket(bucket).await?;
        let path = self.object_path(bucket, key);
        self.write_atomically(&dir, &path, &data).await?;
        self.meta_of(bucket, key, &path).await
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<ObjectRange> {
        self.ensure_bucket(bucket).await?;
        let path = self.object_path(bucket, key);
        let object = self.meta_of(bucket, key, &path).await?;
        let (start, end) = clamp_range(object.size, offset, len).ok_or(
            StoreError::InvalidRange {
                offset,
                size: object.size,
            },
        )?;

        let mut buf = vec![0u8; end - start];
        if !buf.is_empty() {
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(std::io::SeekFrom::Start(start as u64)).await?;
            file.read_exact(&mut buf).await?;
        }
        Ok(ObjectRange {
            data: Bytes::from(buf),
            object,
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.ensure_bucket(bucket).await?;
        match tokio::fs::remove_file(self.object_path(bucket, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::no_such_key(bucket, key))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let dir = self.ensure_bucket(bucket).await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let Ok(key) = urlencoding::decode(name) else { continue };
            if !key.starts_with(prefix) {
                continue;
            }
            if marker.is_some_and(|m| key.as_ref() <= m) {
                continue;
            }
            keys.push(key.into_owned());
        }
        keys.sort();

        let max_keys = max_keys.max(1);
        let is_truncated = keys.len() > max_keys;
        keys.truncate(max_keys);
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
        self.ensure_bucket(src_bucket).await?;
        let src = self.object_path(src_bucket, src_key);
        let data = match tokio::fs::read(&src).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::no_such_key(src_bucket, src_key))
            }
            Err(e) => return Err(e.into()),
        };
        let dir = self.ensure_bucket(dst_bucket).await?;
        let dst = self.object_path(dst_bucket, dst_key);
        self.write_atomically(&dir, &dst, &data).await?;
        self.meta_of(dst_bucket, dst_key, &dst).await
    }
}
