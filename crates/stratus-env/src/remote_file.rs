//! File objects backed by the object store
//!
//! Opening a remote file for reading issues a zero-length ranged read. Point
//! reads are read-after-write consistent whereas listings are not, so the
//! probe is what decides existence; its metadata becomes the file's reported
//! size and modification time.

use crate::error::{EnvError, Result};
use crate::options::RemoteLocation;
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratus_store::{ObjectMeta, ObjectStore, PutOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Notified when a remote table file has been made durable
#[async_trait]
pub trait TableFileListener: Send + Sync {
    /// Called once per successful close
    async fn table_file_closed(&self, logical: &str, physical: &str, size: u64) -> Result<()>;
}

/// Probe an object's existence and metadata with a zero-length read
#[instrument(skip(store, retry))]
pub async fn probe(
    store: &Arc<dyn ObjectStore>,
    retry: &RetryExecutor,
    bucket: &str,
    key: &str,
) -> Result<ObjectMeta> {
    retry
        .remote("probe", || async move {
            let range = store.get_range(bucket, key, 0, 0).await?;
            Ok::<_, EnvError>(range.object)
        })
        .await
}

/// Copy a whole remote object into a local file
///
/// The bytes land in a sibling temp file first, so a concurrent reader never
/// sees a partially downloaded replica.
pub async fn download(
    store: &Arc<dyn ObjectStore>,
    retry: &RetryExecutor,
    bucket: &str,
    key: &str,
    local_path: &Path,
) -> Result<u64> {
    let size = probe(store, retry, bucket, key).await?.size;
    let data = retry
        .remote("download", || async move {
            Ok::<_, EnvError>(store.get_range(bucket, key, 0, size).await?.data)
        })
        .await?;

    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = staging_path(local_path);
    tokio::fs::write(&staging, &data).await?;
    tokio::fs::rename(&staging, local_path).await?;
    debug!(bucket = %bucket, key = %key, path = %local_path.display(), "Downloaded object");
    Ok(data.len() as u64)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".download-{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// A remote object opened for sequential or random reads
pub struct RemoteReadableFile {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    bucket: String,
    key: String,
    size: u64,
    last_modified: DateTime<Utc>,
    position: u64,
}

impl RemoteReadableFile {
    /// Open `name` under `location`, probing for existence
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        location: &RemoteLocation,
        name: &str,
    ) -> Result<Self> {
        let key = location.key(name);
        let meta = probe(&store, &retry, &location.bucket, &key).await?;
        Ok(Self {
            store,
            retry,
            bucket: location.bucket.clone(),
            key,
            size: meta.size,
            last_modified: meta.last_modified,
            position: 0,
        })
    }

    /// Object size as reported by the probe
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time as reported by the probe
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Bucket and key backing this file
    pub fn object(&self) -> (&str, &str) {
        (&self.bucket, &self.key)
    }

    /// Read up to `n` bytes at `offset`; empty at or past the end
    pub async fn read_at(&self, offset: u64, n: usize) -> Result<Bytes> {
        if offset >= self.size || n == 0 {
            return Ok(Bytes::new());
        }
        let len = (n as u64).min(self.size - offset);
        self.retry
            .remote("ranged read", || async move {
                let range = self
                    .store
                    .get_range(&self.bucket, &self.key, offset, len)
                    .await?;
                Ok::<_, EnvError>(range.data)
            })
            .await
    }

    /// Read up to `n` bytes from the current position
    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        let data = self.read_at(self.position, n).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Advance the sequential position, stopping at the end of the file
    pub fn skip(&mut self, n: u64) {
        self.position = self.position.saturating_add(n).min(self.size);
    }

    /// Read the whole object
    pub async fn read_all(&self) -> Result<Bytes> {
        self.read_at(0, self.size as usize).await
    }
}

/// A remote table file opened for writing
///
/// Appended bytes are buffered and uploaded as one object on `sync` and
/// `close`. With a local replica the same bytes are written through to the
/// local file as they arrive. Without a remote target (local-only fork) the
/// replica is the only copy.
pub struct RemoteWritableFile {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    target: Option<(String, String)>,
    replica: Option<tokio::fs::File>,
    buffer: BytesMut,
    logical: String,
    physical: String,
    listener: Option<Arc<dyn TableFileListener>>,
    put_options: PutOptions,
    closed: bool,
}

impl RemoteWritableFile {
    /// Create a writer for `physical` under `location`, with an optional local replica
    pub async fn create(
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        location: Option<&RemoteLocation>,
        logical: &str,
        physical: &str,
        local_replica: Option<&Path>,
    ) -> Result<Self> {
        if location.is_none() && local_replica.is_none() {
            return Err(EnvError::InvalidArgument(format!(
                "table file {} has neither a remote nor a local target",
                logical
            )));
        }
        let replica = match local_replica {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Some(tokio::fs::File::create(path).await?)
            }
            None => None,
        };
        Ok(Self {
            store,
            retry,
            target: location.map(|l| (l.bucket.clone(), l.key(physical))),
            replica,
            buffer: BytesMut::new(),
            logical: logical.to_string(),
            physical: physical.to_string(),
            listener: None,
            put_options: PutOptions::default(),
            closed: false,
        })
    }

    /// Register a listener notified on successful close
    pub fn with_listener(mut self, listener: Arc<dyn TableFileListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Upload with the given encryption options
    pub fn with_put_options(mut self, options: PutOptions) -> Self {
        self.put_options = options;
        self
    }

    /// Name the engine uses for this file
    pub fn logical_name(&self) -> &str {
        &self.logical
    }

    /// Name the bytes are stored under remotely
    pub fn physical_name(&self) -> &str {
        &self.physical
    }

    /// Bytes appended so far
    pub fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Append bytes
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(EnvError::InvalidArgument(format!(
                "append to closed table file {}",
                self.logical
            )));
        }
        self.buffer.extend_from_slice(data);
        if let Some(replica) = self.replica.as_mut() {
            replica.write_all(data).await?;
        }
        Ok(())
    }

    /// Flush the replica and upload everything appended so far
    pub async fn sync(&mut self) -> Result<()> {
        if let Some(replica) = self.replica.as_mut() {
            replica.flush().await?;
            replica.sync_data().await?;
        }
        self.upload().await
    }

    /// Make the file durable and notify the listener
    #[instrument(skip(self), fields(file = %self.logical, size = self.buffer.len()))]
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.sync().await?;
        self.replica = None;
        self.closed = true;
        if let Some(listener) = &self.listener {
            listener
                .table_file_closed(&self.logical, &self.physical, self.size())
                .await?;
        }
        Ok(())
    }

    async fn upload(&self) -> Result<()> {
        let Some((bucket, key)) = &self.target else {
            return Ok(());
        };
        let data = Bytes::copy_from_slice(&self.buffer);
        self.retry
            .remote("upload", || {
                let data = data.clone();
                async move {
                    self.store
                        .put_object_with(bucket, key, data, &self.put_options)
                        .await?;
                    Ok::<_, EnvError>(())
                }
            })
            .await?;
        debug!(bucket = %bucket, key = %key, size = self.buffer.len(), "Uploaded table file");
        Ok(())
    }
}

impl Drop for RemoteWritableFile {
    fn drop(&mut self) {
        if !self.closed && !self.buffer.is_empty() {
            warn!(
                file = %self.logical,
                size = self.buffer.len(),
                "Table file dropped without close; buffered bytes were not uploaded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use stratus_store::MemoryObjectStore;
    use tempfile::TempDir;

    fn retry() -> RetryExecutor {
        RetryExecutor::new(Duration::from_millis(500), Duration::from_millis(5))
    }

    async fn setup() -> (MemoryObjectStore, Arc<dyn ObjectStore>, RemoteLocation) {
        let mem = MemoryObjectStore::new();
        mem.create_bucket("stratus.b").await.unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(mem.clone());
        (mem, store, RemoteLocation::new("stratus.b", "db"))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String, u64)>>);

    #[async_trait]
    impl TableFileListener for Recorder {
        async fn table_file_closed(&self, logical: &str, physical: &str, size: u64) -> Result<()> {
            self.0.lock().push((logical.into(), physical.into(), size));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let (_mem, store, location) = setup().await;
        let err = RemoteReadableFile::open(store, retry(), &location, "000001.sst")
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sequential_and_random_reads() {
        let (_mem, store, location) = setup().await;
        store
            .put_object("stratus.b", "db/000001.sst", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let mut file = RemoteReadableFile::open(store, retry(), &location, "000001.sst")
            .await
            .unwrap();
        assert_eq!(file.size(), 10);
        assert_eq!(file.read(4).await.unwrap().as_ref(), b"0123");
        file.skip(2);
        assert_eq!(file.read(100).await.unwrap().as_ref(), b"6789");
        assert!(file.read(1).await.unwrap().is_empty());

        assert_eq!(file.read_at(8, 5).await.unwrap().as_ref(), b"89");
        assert!(file.read_at(10, 5).await.unwrap().is_empty());
        assert!(file.read_at(42, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_probe_sees_object_missing_from_listing() {
        let (mem, store, location) = setup().await;
        mem.set_list_delay(Duration::from_secs(60));
        store
            .put_object("stratus.b", "db/000002.sst", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let page = store
            .list_objects("stratus.b", "db/", None, 10)
            .await
            .unwrap();
        assert!(page.keys.is_empty());
        let file = RemoteReadableFile::open(store, retry(), &location, "000002.sst")
            .await
            .unwrap();
        assert_eq!(file.size(), 1);
    }

    #[tokio::test]
    async fn test_reads_retry_transient_failures() {
        let (mem, store, location) = setup().await;
        store
            .put_object("stratus.b", "db/000003.sst", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        mem.fail_next(3);
        let file = RemoteReadableFile::open(store, retry(), &location, "000003.sst")
            .await
            .unwrap();
        assert_eq!(file.read_all().await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_write_uploads_on_close_and_keeps_replica() {
        let (_mem, store, location) = setup().await;
        let dir = TempDir::new().unwrap();
        let replica = dir.path().join("000004.sst");
        let recorder = Arc::new(Recorder::default());

        let mut file = RemoteWritableFile::create(
            store.clone(),
            retry(),
            Some(&location),
            "000004.sst",
            "000004.sst-e1",
            Some(&replica),
        )
        .await
        .unwrap()
        .with_listener(recorder.clone());
        file.append(b"hello ").await.unwrap();
        file.append(b"table").await.unwrap();
        file.close().await.unwrap();
        file.close().await.unwrap();

        let range = store
            .get_range("stratus.b", "db/000004.sst-e1", 0, 100)
            .await
            .unwrap();
        assert_eq!(range.data.as_ref(), b"hello table");
        assert_eq!(tokio::fs::read(&replica).await.unwrap(), b"hello table");
        assert_eq!(
            recorder.0.lock().as_slice(),
            &[("000004.sst".to_string(), "000004.sst-e1".to_string(), 11)]
        );
        assert!(file.append(b"more").await.is_err());
    }

    #[tokio::test]
    async fn test_local_only_writer_never_uploads() {
        let (mem, store, _location) = setup().await;
        let dir = TempDir::new().unwrap();
        let replica = dir.path().join("000005.sst");
        let mut file =
            RemoteWritableFile::create(store, retry(), None, "000005.sst", "000005.sst", Some(&replica))
                .await
                .unwrap();
        file.append(b"local").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(mem.object_count("stratus.b"), 0);
        assert_eq!(tokio::fs::read(&replica).await.unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_download_replaces_local_copy() {
        let (_mem, store, _location) = setup().await;
        store
            .put_object("stratus.b", "db/000006.sst", Bytes::from_static(b"remote bytes"))
            .await
            .unwrap();
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("sub").join("000006.sst");
        let n = download(&store, &retry(), "stratus.b", "db/000006.sst", &local)
            .await
            .unwrap();
        assert_eq!(n, 12);
        assert_eq!(tokio::fs::read(&local).await.unwrap(), b"remote bytes");
    }
}
