//! Log stream tailer
//!
//! One background task per environment drains every partition of the log
//! stream into cache files under `<cache_root>/<stream>/`. The task is the
//! only writer of those files; callers read them through [`LogTailer`]
//! lookups, which retry until the record they are waiting for has been
//! materialized. An unrecoverable stream error is latched and makes every
//! later lookup fail immediately.
//!
//! ```text
//!   writer ──append──▶ LogStream ──read_from(cursor)──▶ tail task
//!                                                          │
//!   reader ◀──retry until visible── cache files ◀──apply───┘
//! ```

use crate::error::{EnvError, Result};
use crate::log_record::{LogRecord, RecordKind};
use crate::retry::{Idempotency, RetryExecutor, RetryOn};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use stratus_store::LogStream;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Maximum records fetched from one partition per poll
const READ_BATCH: usize = 256;

/// Cache file name for a logical log segment path
///
/// Every byte outside the unreserved set is percent-escaped, so distinct
/// paths never share a cache file.
pub fn cache_file_name(path: &str) -> String {
    urlencoding::encode(path).into_owned()
}

/// Logical path a cache file name was derived from
pub fn segment_path(cache_name: &str) -> Option<String> {
    urlencoding::decode(cache_name).ok().map(|p| p.into_owned())
}

struct TailerShared {
    log: Arc<dyn LogStream>,
    stream: String,
    cache_dir: PathBuf,
    status: RwLock<Option<String>>,
    applied: AtomicU64,
}

impl TailerShared {
    fn check(&self) -> Result<()> {
        match self.status.read().as_ref() {
            Some(reason) => Err(EnvError::TailerFailed(reason.clone())),
            None => Ok(()),
        }
    }

    fn latch(&self, reason: String) {
        error!(stream = %self.stream, reason = %reason, "Log tailer failed");
        self.status.write().get_or_insert(reason);
    }

    fn cache_path(&self, path: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(path))
    }
}

/// Background task materializing a log stream into local cache files
pub struct LogTailer {
    shared: Arc<TailerShared>,
    retry: RetryExecutor,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogTailer {
    /// Create the stream if needed and start tailing it
    #[instrument(skip(log, retry))]
    pub async fn start(
        log: Arc<dyn LogStream>,
        stream: &str,
        cache_root: &Path,
        poll_interval: Duration,
        retry: RetryExecutor,
    ) -> Result<Self> {
        log.create_stream(stream).await?;
        let partitions = log.partitions(stream).await?;
        let cache_dir = cache_root.join(cache_file_name(stream));
        tokio::fs::create_dir_all(&cache_dir).await?;

        let shared = Arc::new(TailerShared {
            log,
            stream: stream.to_string(),
            cache_dir,
            status: RwLock::new(None),
            applied: AtomicU64::new(0),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(tail(shared.clone(), partitions, stop_rx, poll_interval));
        info!(stream = %stream, cache_dir = %shared.cache_dir.display(), "Log tailer started");

        Ok(Self {
            shared,
            retry,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Stream being tailed
    pub fn stream(&self) -> &str {
        &self.shared.stream
    }

    /// Directory holding this stream's cache files
    pub fn cache_dir(&self) -> &Path {
        &self.shared.cache_dir
    }

    /// Cache file backing a logical log segment path
    pub fn cache_path(&self, path: &str) -> PathBuf {
        self.shared.cache_path(path)
    }

    /// Latched fatal status, if any
    pub fn status(&self) -> Result<()> {
        self.shared.check()
    }

    /// Number of records applied so far
    pub fn applied_records(&self) -> u64 {
        self.shared.applied.load(Ordering::Acquire)
    }

    /// Whether the background task is still running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Signal the task to stop and wait for it
    ///
    /// No new tail iteration starts once the signal is sent. Calling `stop`
    /// more than once is harmless.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(stream = %self.shared.stream, error = %e, "Log tailer task panicked");
            }
            info!(stream = %self.shared.stream, "Log tailer stopped");
        }
    }

    /// Wait until the cache file for `path` exists and return its location
    pub async fn materialized(&self, path: &str) -> Result<PathBuf> {
        let shared = &self.shared;
        self.retry
            .run(
                "log segment lookup",
                Idempotency::Idempotent,
                RetryOn::TransientOrMissing,
                || async move {
                    shared.check()?;
                    let cache = shared.cache_path(path);
                    tokio::fs::metadata(&cache).await?;
                    Ok::<_, EnvError>(cache)
                },
            )
            .await
    }

    /// Size of a materialized log segment
    pub async fn file_size(&self, path: &str) -> Result<u64> {
        let cache = self.materialized(path).await?;
        Ok(tokio::fs::metadata(cache).await?.len())
    }

    /// Modification time of a materialized log segment
    pub async fn modified(&self, path: &str) -> Result<SystemTime> {
        let cache = self.materialized(path).await?;
        Ok(tokio::fs::metadata(cache).await?.modified()?)
    }

    /// Whether a log segment exists, waiting up to the retry budget for it
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.materialized(path).await {
            Ok(_) => Ok(true),
            Err(EnvError::TimedOut { .. }) | Err(EnvError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a writer that appends to `path` through the stream
    pub fn writer(&self, path: &str) -> Result<LogSegmentWriter> {
        self.shared.check()?;
        Ok(LogSegmentWriter {
            shared: self.shared.clone(),
            retry: self.retry.clone(),
            path: path.to_string(),
            offset: 0,
            closed: false,
        })
    }

    /// Append a delete marker for `path`
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.shared.check()?;
        publish(&self.shared, &self.retry, &LogRecord::delete(path)).await
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn publish(shared: &TailerShared, retry: &RetryExecutor, record: &LogRecord) -> Result<()> {
    let payload: Bytes = record.encode()?;
    retry
        .run("log append", Idempotency::NonIdempotent, RetryOn::Transient, || {
            let payload = payload.clone();
            async move {
                shared.log.append(&shared.stream, &record.path, payload).await?;
                Ok::<_, EnvError>(())
            }
        })
        .await
}

/// Appends to one log segment by publishing records to the stream
pub struct LogSegmentWriter {
    shared: Arc<TailerShared>,
    retry: RetryExecutor,
    path: String,
    offset: u64,
    closed: bool,
}

impl LogSegmentWriter {
    /// Logical path of the segment
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bytes appended so far
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Append bytes at the current end of the segment
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(EnvError::InvalidArgument(format!(
                "append to closed log segment {}",
                self.path
            )));
        }
        self.shared.check()?;
        publish(&self.shared, &self.retry, &LogRecord::append(&*self.path, self.offset, data))
            .await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Records are durable once appended
    pub async fn sync(&mut self) -> Result<()> {
        self.shared.check()
    }

    /// Publish the final size
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.shared.check()?;
        publish(&self.shared, &self.retry, &LogRecord::closed(&*self.path, self.offset)).await?;
        self.closed = true;
        Ok(())
    }
}

async fn tail(
    shared: Arc<TailerShared>,
    partitions: Vec<u32>,
    mut stop_rx: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    let mut cursors: HashMap<u32, u64> = partitions.iter().map(|p| (*p, 0)).collect();
    let mut files: HashMap<PathBuf, tokio::fs::File> = HashMap::new();

    'outer: loop {
        if *stop_rx.borrow() {
            break;
        }

        let mut progressed = false;
        for &partition in &partitions {
            let cursor = cursors.get(&partition).copied().unwrap_or(0);
            let records = match shared
                .log
                .read_from(&shared.stream, partition, cursor, READ_BATCH)
                .await
            {
                Ok(records) => records,
                Err(e) if e.is_not_found() => {
                    shared.latch(e.to_string());
                    break 'outer;
                }
                Err(e) => {
                    warn!(stream = %shared.stream, partition, error = %e, "Log stream read failed");
                    continue;
                }
            };

            for record in records {
                let decoded = match LogRecord::decode(&record.payload) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        shared.latch(format!(
                            "undecodable record at partition {} sequence {}: {}",
                            partition, record.sequence, e
                        ));
                        break 'outer;
                    }
                };
                if let Err(e) = apply(&shared, &mut files, &decoded).await {
                    shared.latch(format!("cannot apply record for {}: {}", decoded.path, e));
                    break 'outer;
                }
                cursors.insert(partition, record.sequence + 1);
                shared.applied.fetch_add(1, Ordering::Release);
                progressed = true;
            }
        }

        if !progressed {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    for (_, mut file) in files.drain() {
        let _ = file.flush().await;
    }
    debug!(stream = %shared.stream, "Tail loop exited");
}

async fn apply(
    shared: &TailerShared,
    files: &mut HashMap<PathBuf, tokio::fs::File>,
    record: &LogRecord,
) -> Result<()> {
    let cache = shared.cache_path(&record.path);
    match record.kind {
        RecordKind::Append => {
            if !files.contains_key(&cache) {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&cache)
                    .await?;
                files.insert(cache.clone(), file);
            }
            if let Some(file) = files.get_mut(&cache) {
                file.seek(std::io::SeekFrom::Start(record.offset)).await?;
                file.write_all(&record.data).await?;
                file.flush().await?;
            }
        }
        RecordKind::Delete => {
            files.remove(&cache);
            match tokio::fs::remove_file(&cache).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        RecordKind::Closed => {
            if let Some(file) = files.remove(&cache) {
                file.sync_data().await?;
            }
            let size = match tokio::fs::metadata(&cache).await {
                Ok(m) => m.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tokio::fs::File::create(&cache).await?;
                    0
                }
                Err(e) => return Err(e.into()),
            };
            if size != record.offset {
                warn!(
                    path = %record.path,
                    cached = size,
                    expected = record.offset,
                    "Closed log segment size differs from cache"
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_store::MemoryLogStream;
    use tempfile::TempDir;

    async fn start(log: &MemoryLogStream, dir: &TempDir) -> LogTailer {
        LogTailer::start(
            Arc::new(log.clone()),
            "wal",
            dir.path(),
            Duration::from_millis(5),
            RetryExecutor::new(Duration::from_secs(2), Duration::from_millis(5)),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_cache_file_name_is_flat() {
        assert_eq!(cache_file_name("/db/000003.log"), "%2Fdb%2F000003.log");
        assert_eq!(cache_file_name("000003.log"), "000003.log");
        assert_eq!(segment_path("%2Fdb%2F000003.log").as_deref(), Some("/db/000003.log"));
    }

    #[test]
    fn test_cache_file_names_do_not_collide() {
        let paths = ["/a_b/c.log", "/a/b_c.log", "a/b_c.log", "/a/b%2Fc.log"];
        let names: std::collections::HashSet<String> =
            paths.iter().map(|p| cache_file_name(p)).collect();
        assert_eq!(names.len(), paths.len());
        for path in paths {
            assert_eq!(segment_path(&cache_file_name(path)).as_deref(), Some(path));
        }
    }

    #[tokio::test]
    async fn test_appends_are_materialized() {
        let log = MemoryLogStream::new();
        let dir = TempDir::new().unwrap();
        let tailer = start(&log, &dir).await;

        let mut writer = tailer.writer("/db/000003.log").unwrap();
        writer.append(b"first,").await.unwrap();
        writer.append(b"second").await.unwrap();
        writer.close().await.unwrap();

        let cache = tailer.materialized("/db/000003.log").await.unwrap();
        assert_eq!(cache, dir.path().join("wal").join("%2Fdb%2F000003.log"));
        for _ in 0..200 {
            if tailer.applied_records() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tokio::fs::read(&cache).await.unwrap(), b"first,second");
        assert_eq!(tailer.file_size("/db/000003.log").await.unwrap(), 12);

        tailer.stop().await;
        assert!(!tailer.is_running());
        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_delete_marker_removes_cache_file() {
        let log = MemoryLogStream::new();
        let dir = TempDir::new().unwrap();
        let tailer = start(&log, &dir).await;

        let mut writer = tailer.writer("/db/000004.log").unwrap();
        writer.append(b"x").await.unwrap();
        let cache = tailer.materialized("/db/000004.log").await.unwrap();

        tailer.delete("/db/000004.log").await.unwrap();
        for _ in 0..200 {
            if tokio::fs::metadata(&cache).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(tokio::fs::metadata(&cache).await.is_err());
        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_missing_segment_times_out() {
        let log = MemoryLogStream::new();
        let dir = TempDir::new().unwrap();
        let tailer = LogTailer::start(
            Arc::new(log.clone()),
            "wal",
            dir.path(),
            Duration::from_millis(5),
            RetryExecutor::new(Duration::from_millis(50), Duration::from_millis(5)),
        )
        .await
        .unwrap();

        let err = tailer.materialized("/db/000009.log").await.unwrap_err();
        assert!(matches!(err, EnvError::TimedOut { .. }));
        assert!(!tailer.exists("/db/000009.log").await.unwrap());
        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_corrupt_record_latches_fatal_status() {
        let log = MemoryLogStream::new();
        let dir = TempDir::new().unwrap();
        let tailer = start(&log, &dir).await;

        log.append("wal", "/db/000005.log", Bytes::from_static(b"\xff\xff"))
            .await
            .unwrap();
        for _ in 0..200 {
            if tailer.status().is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = tailer.materialized("/db/000005.log").await.unwrap_err();
        assert!(err.is_fatal());
        assert!(tailer.writer("/db/000006.log").is_err());
        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_deleted_stream_is_fatal() {
        let log = MemoryLogStream::new();
        let dir = TempDir::new().unwrap();
        let tailer = start(&log, &dir).await;
        log.delete_stream("wal");
        for _ in 0..200 {
            if tailer.status().is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(tailer.status(), Err(EnvError::TailerFailed(_))));
        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_records_stream_in() {
        let log = MemoryLogStream::new();
        let dir = TempDir::new().unwrap();
        let tailer = start(&log, &dir).await;

        let mut writer = tailer.writer("/db/000007.log").unwrap();
        let (done_tx, mut done_rx) = watch::channel(false);
        let producer = tokio::spawn(async move {
            while !*done_rx.borrow_and_update() {
                writer.append(b"record").await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        for _ in 0..200 {
            if tailer.applied_records() >= 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(tailer.applied_records() >= 20);

        tailer.stop().await;
        assert!(!tailer.is_running());
        let applied = tailer.applied_records();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tailer.applied_records(), applied);
        assert!(log.record_count("wal") as u64 > applied);

        done_tx.send(true).unwrap();
        producer.await.unwrap();
    }
}
