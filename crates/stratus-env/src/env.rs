//! The cloud environment facade
//!
//! [`CloudEnv`] offers the file, directory and lock operations an embedded
//! storage engine expects and routes each call by the path's role:
//!
//! | Role | Route |
//! |------|-------|
//! | table file | object store (plus local replica when kept locally) |
//! | log segment | log stream and tailer cache, or local disk |
//! | other | local disk |

use crate::classifier::{basename, classify, FileRole};
use crate::clone::{CloneCoordinator, OpenKind, SavepointReport};
use crate::deletion::{Cancellation, DeletionAction, DeletionLedger};
use crate::error::{EnvError, Result};
use crate::file::{
    Directory, FileLock, FileOptions, LocalReadFile, LocalWriteFile, ReadableFile, WritableFile,
};
use crate::gc::GarbageCollector;
use crate::options::{CloudEnvOptions, RemoteLocation};
use crate::ownership::{
    logical_name, new_epoch_id, physical_name, Generation, GenerationTracker, ManifestBackend,
    OwnershipManifest, OwnershipPointer,
};
use crate::registry::DbIdentity;
use crate::remote_file::{download, RemoteReadableFile, RemoteWritableFile};
use crate::retry::RetryExecutor;
use crate::tailer::{segment_path, LogTailer};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stratus_store::{list_all, LogStream, ObjectStore};
use tracing::{debug, info, instrument, warn};

/// Whether the environment may write table files
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpenMode {
    ReadWrite,
    ReadOnly,
}

/// Storage environment backed by an object store and an optional log stream
pub struct CloudEnv {
    options: CloudEnvOptions,
    local_dir: PathBuf,
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    coordinator: CloneCoordinator,
    manifest: OwnershipManifest,
    tracker: Arc<GenerationTracker>,
    ledger: DeletionLedger,
    tailer: Option<LogTailer>,
    dbid: String,
    open_kind: OpenKind,
    epoch: u64,
    instance_id: String,
    mode: OpenMode,
    keep_local: bool,
    closed: AtomicBool,
}

impl CloudEnv {
    /// Open an environment for a database whose local directory is `local_dir`
    ///
    /// Validates the options, resolves the database identity, claims
    /// ownership of the destination and starts the log tailer when log
    /// segments go through a stream.
    pub async fn open(
        local_dir: impl Into<PathBuf>,
        options: CloudEnvOptions,
        store: Arc<dyn ObjectStore>,
        log: Option<Arc<dyn LogStream>>,
    ) -> Result<Self> {
        Self::open_with(local_dir.into(), options, store, log, OpenMode::ReadWrite).await
    }

    /// Open without claiming ownership; table files cannot be written
    pub async fn open_read_only(
        local_dir: impl Into<PathBuf>,
        options: CloudEnvOptions,
        store: Arc<dyn ObjectStore>,
        log: Option<Arc<dyn LogStream>>,
    ) -> Result<Self> {
        Self::open_with(local_dir.into(), options, store, log, OpenMode::ReadOnly).await
    }

    #[instrument(skip_all, fields(local_dir = %local_dir.display(), mode = ?mode))]
    async fn open_with(
        local_dir: PathBuf,
        options: CloudEnvOptions,
        store: Arc<dyn ObjectStore>,
        log: Option<Arc<dyn LogStream>>,
        mode: OpenMode,
    ) -> Result<Self> {
        options.validate()?;
        let tail_logs = !options.keep_local_log_files;
        if tail_logs && log.is_none() {
            return Err(EnvError::InvalidArgument(
                "log segments are routed to a log stream but none was supplied".into(),
            ));
        }

        let retry = RetryExecutor::new(options.retry_timeout, options.retry_interval);
        let src = options.src_location();
        let dest = options.dest_location();
        tokio::fs::create_dir_all(&local_dir).await?;

        if let Some(dest) = dest.as_ref().filter(|_| options.create_bucket_if_missing) {
            let (store, bucket) = (&store, dest.bucket.as_str());
            retry
                .remote("create bucket", || async move {
                    store.create_bucket(bucket).await?;
                    Ok::<_, EnvError>(())
                })
                .await?;
        }

        let coordinator = CloneCoordinator::new(store.clone(), retry.clone(), src, dest.clone());
        let resolution = coordinator.resolve_identity(&local_dir).await?;
        let keep_local = options.keep_local_sst_files || dest.is_none();

        let instance_id = uuid::Uuid::new_v4().to_string();
        let backend = match &dest {
            Some(dest) => ManifestBackend::Remote {
                store: store.clone(),
                retry: retry.clone(),
                location: dest.clone(),
            },
            None => ManifestBackend::Local {
                dir: local_dir.clone(),
            },
        };
        let manifest = OwnershipManifest::new(backend, instance_id.clone());

        let (epoch, tracker) = match mode {
            OpenMode::ReadWrite => {
                let seed = match manifest.pointer().await? {
                    Some(_) => None,
                    None => coordinator.source_generation().await?,
                };
                let claim = manifest
                    .claim_for_write(&resolution.dbid, seed.as_ref())
                    .await?;
                let tracker = GenerationTracker::new(claim.generation, Some(manifest.clone()));
                (claim.pointer.epoch, tracker)
            }
            OpenMode::ReadOnly => {
                let generation = match manifest.authoritative().await? {
                    Some(claim) => claim.generation,
                    None => coordinator
                        .source_generation()
                        .await?
                        .unwrap_or_else(|| Generation::new(new_epoch_id(), &*resolution.dbid)),
                };
                (0, GenerationTracker::new(generation, None))
            }
        };

        let tailer = match (tail_logs, log, options.log_stream.as_deref()) {
            (true, Some(log), Some(stream)) => {
                let cache_root = options
                    .log_cache_dir
                    .clone()
                    .unwrap_or_else(|| local_dir.join(".log-cache"));
                Some(
                    LogTailer::start(
                        log,
                        stream,
                        &cache_root,
                        options.tailer_poll_interval,
                        retry.clone(),
                    )
                    .await?,
                )
            }
            _ => None,
        };

        let env = Self {
            ledger: DeletionLedger::new(options.file_deletion_delay),
            options,
            local_dir,
            store,
            retry,
            coordinator,
            manifest,
            tracker: Arc::new(tracker),
            tailer,
            dbid: resolution.dbid,
            open_kind: resolution.kind,
            epoch,
            instance_id,
            mode,
            keep_local,
            closed: AtomicBool::new(false),
        };

        if env.keep_local && env.options.hydrate_on_open {
            env.hydrate().await?;
        }
        info!(
            dbid = %env.dbid,
            kind = ?env.open_kind,
            epoch = env.epoch,
            live_files = env.tracker.snapshot().files.len(),
            "Opened cloud environment"
        );
        Ok(env)
    }

    /// Fetch every live table file missing from the local directory
    async fn hydrate(&self) -> Result<()> {
        let generation = self.tracker.snapshot();
        let mut fetched = 0;
        for (logical, physical) in &generation.files {
            let local = self.local_dir.join(logical);
            if tokio::fs::try_exists(&local).await? {
                continue;
            }
            match self.coordinator.locate(physical).await? {
                Some((location, _)) => {
                    download(
                        &self.store,
                        &self.retry,
                        &location.bucket,
                        &location.key(physical),
                        &local,
                    )
                    .await?;
                    fetched += 1;
                }
                None => warn!(file = %logical, physical = %physical, "Live table file missing remotely"),
            }
        }
        if fetched > 0 {
            info!(fetched, "Fetched live table files into local directory");
        }
        Ok(())
    }

    /// Database identity
    pub fn dbid(&self) -> &str {
        &self.dbid
    }

    /// How the identity was obtained
    pub fn open_kind(&self) -> OpenKind {
        self.open_kind
    }

    /// Epoch this instance claimed; 0 when read-only
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Epoch id table files are written under
    pub fn epoch_id(&self) -> String {
        self.tracker.epoch_id()
    }

    /// Identity written into the ownership pointer
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Local directory of the database
    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Options the environment was opened with
    pub fn options(&self) -> &CloudEnvOptions {
        &self.options
    }

    /// Source location, if any
    pub fn src(&self) -> Option<&RemoteLocation> {
        self.coordinator.src()
    }

    /// Destination location, if any
    pub fn dest(&self) -> Option<&RemoteLocation> {
        self.coordinator.dest()
    }

    /// Whether reads fall back to a distinct source
    pub fn is_fork(&self) -> bool {
        self.coordinator.is_fork()
    }

    /// Whether table files are kept on local disk
    pub fn keeps_local_table_files(&self) -> bool {
        self.keep_local
    }

    /// Copy of the live generation
    pub fn live_generation(&self) -> Generation {
        self.tracker.snapshot()
    }

    /// Number of table files waiting for delayed deletion
    pub fn pending_deletions(&self) -> usize {
        self.ledger.len()
    }

    /// The log tailer, when log segments go through a stream
    pub fn tailer(&self) -> Option<&LogTailer> {
        self.tailer.as_ref()
    }

    /// Re-read the ownership pointer of the destination
    pub async fn current_pointer(&self) -> Result<Option<OwnershipPointer>> {
        self.manifest.pointer().await
    }

    /// Whether this instance still holds the latest claim
    pub async fn is_authoritative(&self) -> Result<bool> {
        Ok(self
            .manifest
            .pointer()
            .await?
            .is_some_and(|p| p.writer == self.instance_id))
    }

    fn physical_for(&self, logical: &str) -> String {
        self.tracker
            .resolve(logical)
            .unwrap_or_else(|| physical_name(logical, &self.tracker.epoch_id()))
    }

    /// Physical name of a table file, unless it is waiting for deletion
    fn visible_physical(&self, path: &str) -> Option<String> {
        if self.ledger.is_pending(&replica_key(path)) {
            return None;
        }
        let physical = self.physical_for(basename(path));
        (!self.ledger.is_pending(&physical)).then_some(physical)
    }

    fn ensure_writable(&self, path: &str) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(EnvError::NotSupported(format!(
                "{} cannot be modified through a read-only environment",
                path
            )));
        }
        Ok(())
    }

    fn check_mmap(&self, path: &str, options: &FileOptions) -> Result<()> {
        if options.wants_mmap() && !self.keep_local {
            return Err(EnvError::InvalidArgument(format!(
                "memory mapping {} requires table files to be kept locally",
                path
            )));
        }
        Ok(())
    }

    async fn fetch_table(&self, path: &str, physical: &str, local: &Path) -> Result<()> {
        match self.coordinator.locate(physical).await? {
            Some((location, _)) => {
                download(&self.store, &self.retry, &location.bucket, &location.key(physical), local)
                    .await?;
                Ok(())
            }
            None => Err(EnvError::NotFound(path.to_string())),
        }
    }

    async fn open_for_read(&self, path: &str, options: &FileOptions) -> Result<ReadableFile> {
        match classify(path) {
            FileRole::TableFile => {
                self.check_mmap(path, options)?;
                let physical = self
                    .visible_physical(path)
                    .ok_or_else(|| EnvError::NotFound(path.to_string()))?;
                if self.keep_local {
                    let local = Path::new(path);
                    if !tokio::fs::try_exists(local).await? {
                        self.fetch_table(path, &physical, local).await?;
                    }
                    return Ok(ReadableFile::LocalFile(LocalReadFile::open(local).await?));
                }
                match self.coordinator.locate(&physical).await? {
                    Some((location, _)) => Ok(ReadableFile::RemoteTableFile(
                        RemoteReadableFile::open(
                            self.store.clone(),
                            self.retry.clone(),
                            &location,
                            &physical,
                        )
                        .await?,
                    )),
                    None => Err(EnvError::NotFound(path.to_string())),
                }
            }
            FileRole::LogSegment => match self.tailer() {
                Some(tailer) => {
                    let cache = tailer.materialized(path).await?;
                    Ok(ReadableFile::TailedLogFile(LocalReadFile::open(&cache).await?))
                }
                None => Ok(ReadableFile::LocalFile(LocalReadFile::open(Path::new(path)).await?)),
            },
            FileRole::Other => Ok(ReadableFile::LocalFile(LocalReadFile::open(Path::new(path)).await?)),
        }
    }

    /// Open a file for sequential reads
    pub async fn new_sequential_file(&self, path: &str, options: &FileOptions) -> Result<ReadableFile> {
        self.open_for_read(path, options).await
    }

    /// Open a file for random reads
    pub async fn new_random_access_file(
        &self,
        path: &str,
        options: &FileOptions,
    ) -> Result<ReadableFile> {
        self.open_for_read(path, options).await
    }

    /// Create or truncate a file for writing
    ///
    /// Recreating a table file cancels a pending delayed deletion of its local
    /// replica and of its physical name before any byte is written. A
    /// deletion that is already running is awaited instead.
    pub async fn new_writable_file(&self, path: &str, options: &FileOptions) -> Result<WritableFile> {
        match classify(path) {
            FileRole::TableFile => {
                self.ensure_writable(path)?;
                self.check_mmap(path, options)?;
                let name = basename(path);
                let physical = physical_name(name, &self.tracker.epoch_id());
                for pending in [replica_key(path), physical.clone()] {
                    match self.ledger.cancel(&pending).await {
                        Cancellation::Cancelled => {
                            info!(file = %path, "Recreated table file before its deletion fell due")
                        }
                        Cancellation::Completed => {
                            info!(file = %path, "Recreated table file after its running deletion finished")
                        }
                        Cancellation::NotPending => {}
                    }
                }
                let replica = self.keep_local.then(|| Path::new(path));
                let file = RemoteWritableFile::create(
                    self.store.clone(),
                    self.retry.clone(),
                    self.coordinator.dest(),
                    name,
                    &physical,
                    replica,
                )
                .await?
                .with_listener(self.tracker.clone())
                .with_put_options(self.options.put_options());
                Ok(WritableFile::RemoteTableFile(file))
            }
            FileRole::LogSegment => match self.tailer() {
                Some(tailer) => Ok(WritableFile::TailedLogFile(tailer.writer(path)?)),
                None => Ok(WritableFile::LocalFile(LocalWriteFile::create(Path::new(path)).await?)),
            },
            FileRole::Other => Ok(WritableFile::LocalFile(LocalWriteFile::create(Path::new(path)).await?)),
        }
    }

    /// Open a directory handle, creating the local directory if needed
    pub async fn new_directory(&self, path: &str) -> Result<Directory> {
        tokio::fs::create_dir_all(path).await?;
        Ok(Directory::new(PathBuf::from(path)))
    }

    /// Whether a file exists
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        match classify(path) {
            FileRole::TableFile => {
                let Some(physical) = self.visible_physical(path) else {
                    return Ok(false);
                };
                if self.keep_local && tokio::fs::try_exists(path).await? {
                    return Ok(true);
                }
                Ok(self.coordinator.locate(&physical).await?.is_some())
            }
            FileRole::LogSegment => match self.tailer() {
                Some(tailer) => tailer.exists(path).await,
                None => Ok(tokio::fs::try_exists(path).await?),
            },
            FileRole::Other => Ok(tokio::fs::try_exists(path).await?),
        }
    }

    /// Names of the entries of a directory
    ///
    /// Merges the remote listing with the local directory. Remote table files
    /// are reported under their logical names when they are the live version;
    /// table files that exist only locally are not durable and are omitted
    /// unless the environment has no remote destination.
    pub async fn get_children(&self, dir: &str) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        let remote_backed = self.coordinator.dest().is_some();

        match tokio::fs::read_dir(dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    if classify(&name) == FileRole::TableFile
                        && (remote_backed
                            || self
                                .ledger
                                .is_pending(&replica_key(&entry.path().to_string_lossy())))
                    {
                        continue;
                    }
                    names.insert(name);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let locations = self
            .coordinator
            .dest()
            .into_iter()
            .chain(self.coordinator.src().filter(|_| self.is_fork()));
        for location in locations {
            let listing_prefix = location.listing_prefix();
            let (store, bucket, prefix, page_size) = (
                &self.store,
                location.bucket.as_str(),
                listing_prefix.as_str(),
                self.options.list_page_size,
            );
            let keys = self
                .retry
                .remote("list children", || async move {
                    Ok::<_, EnvError>(list_all(&**store, bucket, prefix, page_size).await?)
                })
                .await?;
            for key in keys {
                let physical = &key[listing_prefix.len()..];
                let logical = logical_name(physical);
                if classify(logical) == FileRole::TableFile
                    && self.tracker.resolve(logical).as_deref() == Some(physical)
                {
                    names.insert(logical.to_string());
                }
            }
        }

        if let Some(tailer) = self.tailer() {
            if let Ok(mut entries) = tokio::fs::read_dir(tailer.cache_dir()).await {
                while let Some(entry) = entries.next_entry().await? {
                    let Some(segment) = entry.file_name().to_str().and_then(segment_path) else {
                        continue;
                    };
                    let segment = Path::new(&segment);
                    if segment.parent() == Some(Path::new(dir)) {
                        if let Some(name) = segment.file_name().and_then(|n| n.to_str()) {
                            names.insert(name.to_string());
                        }
                    }
                }
            }
        }

        Ok(names.into_iter().collect())
    }

    /// Delete a file
    ///
    /// Table files leave the live generation immediately; their bytes are
    /// removed once the grace period passes unless the name is recreated
    /// first. Log segments get a delete marker on the stream.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        match classify(path) {
            FileRole::TableFile => {
                self.ensure_writable(path)?;
                if !self.file_exists(path).await? {
                    return Err(EnvError::NotFound(path.to_string()));
                }
                let name = basename(path);
                let physical = match self.tracker.remove(name).await? {
                    Some(physical) => physical,
                    None => physical_name(name, &self.tracker.epoch_id()),
                };
                if let Some(action) = self.remote_deletion(&physical) {
                    self.ledger.schedule(&physical, action);
                }
                if self.keep_local {
                    self.ledger.schedule(&replica_key(path), replica_removal(path));
                }
                debug!(file = %path, physical = %physical, grace = ?self.ledger.grace(), "Scheduled table file deletion");
                Ok(())
            }
            FileRole::LogSegment => match self.tailer() {
                Some(tailer) => tailer.delete(path).await,
                None => Ok(tokio::fs::remove_file(path).await?),
            },
            FileRole::Other => Ok(tokio::fs::remove_file(path).await?),
        }
    }

    /// Removal of a table file's destination object
    ///
    /// Source objects of a fork are never touched.
    fn remote_deletion(&self, physical: &str) -> Option<DeletionAction> {
        let dest = self.coordinator.dest()?;
        let store = self.store.clone();
        let retry = self.retry.clone();
        let (bucket, key) = (dest.bucket.clone(), dest.key(physical));

        let action: DeletionAction = Box::new(move || {
            async move {
                let (store, bucket, key) = (&store, bucket.as_str(), key.as_str());
                let result = retry
                    .remote("delayed delete", || async move {
                        store.delete_object(bucket, key).await?;
                        Ok::<_, EnvError>(())
                    })
                    .await;
                match result {
                    Err(e) if !e.is_not_found() => Err(e),
                    _ => Ok(()),
                }
            }
            .boxed()
        });
        Some(action)
    }

    async fn put_marker(&self) -> Result<()> {
        let Some(dest) = self.coordinator.dest() else {
            return Ok(());
        };
        let key = dest.marker_key();
        let (store, bucket, key) = (&self.store, dest.bucket.as_str(), key.as_str());
        self.retry
            .remote("create directory marker", || async move {
                store.put_object(bucket, key, bytes::Bytes::new()).await?;
                Ok::<_, EnvError>(())
            })
            .await
    }

    /// Create a directory; fails if it exists locally
    pub async fn create_dir(&self, dir: &str) -> Result<()> {
        tokio::fs::create_dir(dir).await?;
        self.put_marker().await
    }

    /// Create a directory and its parents if missing
    pub async fn create_dir_if_missing(&self, dir: &str) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        self.put_marker().await
    }

    /// Delete an empty directory
    ///
    /// Refused while the destination still holds objects under the prefix.
    pub async fn delete_dir(&self, dir: &str) -> Result<()> {
        if let Some(dest) = self.coordinator.dest() {
            let listing_prefix = dest.listing_prefix();
            let (store, bucket, prefix) = (&self.store, dest.bucket.as_str(), listing_prefix.as_str());
            let page = self
                .retry
                .remote("list directory", || async move {
                    Ok::<_, EnvError>(store.list_objects(bucket, prefix, None, 1).await?)
                })
                .await?;
            if !page.keys.is_empty() {
                return Err(EnvError::Io(format!(
                    "directory {} is not empty remotely ({} ...)",
                    dir, page.keys[0]
                )));
            }
            let key = dest.marker_key();
            let key = key.as_str();
            let result = self
                .retry
                .remote("delete directory marker", || async move {
                    store.delete_object(bucket, key).await?;
                    Ok::<_, EnvError>(())
                })
                .await;
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Size of a file in bytes
    ///
    /// For table files the remote size is authoritative; a differing local
    /// replica is reported as a warning.
    pub async fn get_file_size(&self, path: &str) -> Result<u64> {
        match classify(path) {
            FileRole::TableFile => {
                let physical = self
                    .visible_physical(path)
                    .ok_or_else(|| EnvError::NotFound(path.to_string()))?;
                let local = if self.keep_local {
                    match tokio::fs::metadata(path).await {
                        Ok(m) => Some(m.len()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    None
                };
                let remote = if local.is_none() || self.options.validate_file_size {
                    self.coordinator.locate(&physical).await?.map(|(_, meta)| meta.size)
                } else {
                    None
                };
                match (local, remote) {
                    (Some(local), Some(remote)) if local != remote => {
                        warn!(file = %path, local, remote, "Local table file size differs from remote");
                        Ok(remote)
                    }
                    (_, Some(remote)) => Ok(remote),
                    (Some(local), None) => Ok(local),
                    (None, None) => Err(EnvError::NotFound(path.to_string())),
                }
            }
            FileRole::LogSegment => match self.tailer() {
                Some(tailer) => tailer.file_size(path).await,
                None => Ok(tokio::fs::metadata(path).await?.len()),
            },
            FileRole::Other => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    /// Last modification time of a file
    pub async fn get_file_modification_time(&self, path: &str) -> Result<DateTime<Utc>> {
        match classify(path) {
            FileRole::TableFile => {
                let physical = self.physical_for(basename(path));
                if let Some((_, meta)) = self.coordinator.locate(&physical).await? {
                    return Ok(meta.last_modified);
                }
                if self.keep_local {
                    return Ok(tokio::fs::metadata(path).await?.modified()?.into());
                }
                Err(EnvError::NotFound(path.to_string()))
            }
            FileRole::LogSegment => match self.tailer() {
                Some(tailer) => Ok(tailer.modified(path).await?.into()),
                None => Ok(tokio::fs::metadata(path).await?.modified()?.into()),
            },
            FileRole::Other => Ok(tokio::fs::metadata(path).await?.modified()?.into()),
        }
    }

    fn refuse_remote_role(&self, operation: &str, paths: &[&str]) -> Result<()> {
        for path in paths {
            if classify(path) != FileRole::Other {
                return Err(EnvError::NotSupported(format!(
                    "{} of {} is not supported by the remote store",
                    operation, path
                )));
            }
        }
        Ok(())
    }

    /// Rename a file; table files and log segments cannot be renamed
    pub async fn rename_file(&self, src: &str, target: &str) -> Result<()> {
        self.refuse_remote_role("rename", &[src, target])?;
        Ok(tokio::fs::rename(src, target).await?)
    }

    /// Hard-link a file; table files and log segments cannot be linked
    pub async fn link_file(&self, src: &str, target: &str) -> Result<()> {
        self.refuse_remote_role("link", &[src, target])?;
        Ok(tokio::fs::hard_link(src, target).await?)
    }

    /// Acquire a lock token
    ///
    /// The remote store has no lock primitive, so this never excludes another
    /// process. Ownership is arbitrated by the pointer instead.
    pub async fn lock_file(&self, path: &str) -> Result<FileLock> {
        debug!(path = %path, "Lock requested; locks are advisory no-ops");
        Ok(FileLock::new(path))
    }

    /// Release a lock token
    pub async fn unlock_file(&self, lock: FileLock) -> Result<()> {
        debug!(path = %lock.path(), "Lock released");
        Ok(())
    }

    /// Copy live files still living only in the source to the destination
    pub async fn savepoint(&self) -> Result<SavepointReport> {
        self.coordinator.savepoint(&self.tracker.snapshot()).await
    }

    fn collector(&self) -> Result<GarbageCollector> {
        let location = self
            .coordinator
            .dest()
            .or(self.coordinator.src())
            .ok_or_else(|| EnvError::InvalidArgument("no remote bucket configured".into()))?;
        Ok(
            GarbageCollector::new(self.store.clone(), self.retry.clone(), location.bucket.clone())
                .with_page_size(self.options.list_page_size),
        )
    }

    /// Keys of unreachable table and generation files in the bucket
    pub async fn find_obsolete_files(&self) -> Result<Vec<String>> {
        self.collector()?.find_obsolete_files().await
    }

    /// Registry entries of databases that no longer have a pointer
    pub async fn find_obsolete_dbids(&self) -> Result<Vec<DbIdentity>> {
        self.collector()?.find_obsolete_dbids().await
    }

    /// Delete objects previously reported by [`CloudEnv::find_obsolete_files`]
    pub async fn delete_obsolete_files(&self, keys: &[String]) -> Result<usize> {
        self.collector()?.delete_objects(keys).await
    }

    /// Remove registry entries previously reported by [`CloudEnv::find_obsolete_dbids`]
    pub async fn delete_dbids(&self, dbids: &[String]) -> Result<usize> {
        self.collector()?.delete_dbids(dbids).await
    }

    /// Stop the tailer, persist the generation and drop pending deletions
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(tailer) = &self.tailer {
            tailer.stop().await;
        }
        self.ledger.abandon_all();
        if self.mode == OpenMode::ReadWrite {
            self.tracker.persist().await?;
        }
        info!(dbid = %self.dbid, "Closed cloud environment");
        Ok(())
    }
}

impl Drop for CloudEnv {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            debug!(dbid = %self.dbid, "Cloud environment dropped without close");
        }
    }
}

/// Ledger key of a table file's local replica
///
/// Replicas are tracked by path, apart from the physical names of remote
/// objects, so recreating a logical name stops only the removal of its own
/// local copy.
fn replica_key(path: &str) -> String {
    format!("replica:{}", path)
}

fn replica_removal(path: &str) -> DeletionAction {
    let replica = PathBuf::from(path);
    Box::new(move || {
        async move {
            match tokio::fs::remove_file(&replica).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stratus_store::{MemoryLogStream, MemoryObjectStore};
    use tempfile::TempDir;

    fn options(path: &str) -> CloudEnvOptions {
        CloudEnvOptions::new("b", path)
            .with_retry(Duration::from_millis(500), Duration::from_millis(10))
            .with_file_deletion_delay(Duration::from_millis(100))
    }

    fn table(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    async fn write(env: &CloudEnv, path: &str, data: &[u8]) {
        let mut file = env
            .new_writable_file(path, &FileOptions::default())
            .await
            .unwrap();
        file.append(data).await.unwrap();
        file.close().await.unwrap();
    }

    async fn read(env: &CloudEnv, path: &str) -> Vec<u8> {
        let mut file = env
            .new_sequential_file(path, &FileOptions::default())
            .await
            .unwrap();
        file.read_to_end().await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_table_files_are_served_remotely() {
        let store = MemoryObjectStore::new();
        let dir = TempDir::new().unwrap();
        let env = CloudEnv::open(dir.path(), options("db"), Arc::new(store.clone()), None)
            .await
            .unwrap();
        assert_eq!(env.open_kind(), OpenKind::NewDatabase);
        assert_eq!(env.epoch(), 1);

        let path = table(&dir, "000007.sst");
        write(&env, &path, b"sorted bytes").await;
        assert!(!Path::new(&path).exists());

        let file = env
            .new_random_access_file(&path, &FileOptions::default())
            .await
            .unwrap();
        assert!(matches!(file, ReadableFile::RemoteTableFile(_)));
        assert_eq!(&file.read_at(7, 100).await.unwrap()[..], b"bytes");
        assert_eq!(env.get_file_size(&path).await.unwrap(), 12);

        let physical = physical_name("000007.sst", &env.epoch_id());
        assert!(store.keys("stratus.b").contains(&format!("db/{}", physical)));
        let children = env.get_children(&dir.path().to_string_lossy()).await.unwrap();
        assert!(children.contains(&"000007.sst".to_string()));
        env.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_table_uploads_carry_encryption_options() {
        let store = MemoryObjectStore::new();
        let dir = TempDir::new().unwrap();
        let opts = options("db").with_server_side_encryption(Some("key-7".to_string()));
        let env = CloudEnv::open(dir.path(), opts, Arc::new(store.clone()), None)
            .await
            .unwrap();
        let path = table(&dir, "000008.sst");
        write(&env, &path, b"sealed").await;

        let key = format!("db/{}", physical_name("000008.sst", &env.epoch_id()));
        let encryption = store.encryption("stratus.b", &key).unwrap();
        assert!(encryption.server_side_encryption);
        assert_eq!(encryption.encryption_key_id.as_deref(), Some("key-7"));
        assert_eq!(read(&env, &path).await, b"sealed");
    }

    #[tokio::test]
    async fn test_local_replica_is_kept() {
        let store = MemoryObjectStore::new();
        let dir = TempDir::new().unwrap();
        let env = CloudEnv::open(
            dir.path(),
            options("db").with_keep_local_sst_files(true),
            Arc::new(store),
            None,
        )
        .await
        .unwrap();

        let path = table(&dir, "000001.sst");
        write(&env, &path, b"replicated").await;
        assert_eq!(std::fs::read(&path).unwrap(), b"replicated");

        let file = env
            .new_random_access_file(&path, &FileOptions::default().with_mmap_reads())
            .await
            .unwrap();
        assert!(matches!(file, ReadableFile::LocalFile(_)));

        std::fs::remove_file(&path).unwrap();
        assert_eq!(read(&env, &path).await, b"replicated");
        assert!(Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_mmap_requires_local_tables() {
        let dir = TempDir::new().unwrap();
        let env = CloudEnv::open(dir.path(), options("db"), Arc::new(MemoryObjectStore::new()), None)
            .await
            .unwrap();
        let path = table(&dir, "000001.sst");
        write(&env, &path, b"x").await;

        let err = env
            .new_random_access_file(&path, &FileOptions::default().with_mmap_reads())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EnvError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_deleted_table_file_survives_grace_period() {
        let store = MemoryObjectStore::new();
        let dir = TempDir::new().unwrap();
        let env = CloudEnv::open(dir.path(), options("db"), Arc::new(store.clone()), None)
            .await
            .unwrap();
        let path = table(&dir, "000003.sst");
        write(&env, &path, b"old").await;
        let key = format!("db/{}", physical_name("000003.sst", &env.epoch_id()));

        env.delete_file(&path).await.unwrap();
        assert!(!env.file_exists(&path).await.unwrap());
        assert_eq!(env.pending_deletions(), 1);
        assert!(store.keys("stratus.b").contains(&key));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!store.keys("stratus.b").contains(&key));
        assert_eq!(env.pending_deletions(), 0);

        let err = env.delete_file(&path).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_recreate_cancels_pending_deletion() {
        let store = MemoryObjectStore::new();
        let dir = TempDir::new().unwrap();
        let env = CloudEnv::open(dir.path(), options("db"), Arc::new(store.clone()), None)
            .await
            .unwrap();
        let path = table(&dir, "000004.sst");
        write(&env, &path, b"first").await;
        env.delete_file(&path).await.unwrap();

        write(&env, &path, b"second").await;
        assert_eq!(env.pending_deletions(), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(read(&env, &path).await, b"second");
    }

    #[tokio::test]
    async fn test_recreate_waits_for_running_deletion() {
        let store = MemoryObjectStore::new();
        let dir = TempDir::new().unwrap();
        let env = CloudEnv::open(dir.path(), options("db"), Arc::new(store.clone()), None)
            .await
            .unwrap();
        let path = table(&dir, "000005.sst");
        write(&env, &path, b"first").await;
        let key = format!("db/{}", physical_name("000005.sst", &env.epoch_id()));

        env.delete_file(&path).await.unwrap();
        // The delayed delete keeps hitting transient errors for a while.
        store.fail_next(20);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(env.pending_deletions(), 1);

        write(&env, &path, b"second").await;
        assert_eq!(env.pending_deletions(), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.keys("stratus.b").contains(&key));
        assert_eq!(read(&env, &path).await, b"second");
    }

    #[tokio::test]
    async fn test_recreated_inherited_table_survives_grace() {
        let store = MemoryObjectStore::new();
        let dir = TempDir::new().unwrap();
        let opts = options("db").with_keep_local_sst_files(true);
        let path = table(&dir, "000001.sst");

        let first = CloudEnv::open(dir.path(), opts.clone(), Arc::new(store.clone()), None)
            .await
            .unwrap();
        write(&first, &path, b"old bytes").await;
        let old_key = format!("db/{}", physical_name("000001.sst", &first.epoch_id()));
        first.close().await.unwrap();
        drop(first);

        let env = CloudEnv::open(dir.path(), opts, Arc::new(store.clone()), None)
            .await
            .unwrap();
        assert_eq!(env.epoch(), 2);
        env.delete_file(&path).await.unwrap();
        assert!(Path::new(&path).exists());
        assert!(!env.file_exists(&path).await.unwrap());

        write(&env, &path, b"new bytes").await;
        let new_key = format!("db/{}", physical_name("000001.sst", &env.epoch_id()));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(env.file_exists(&path).await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"new bytes");
        assert_eq!(read(&env, &path).await, b"new bytes");
        let keys = store.keys("stratus.b");
        assert!(!keys.contains(&old_key));
        assert!(keys.contains(&new_key));
    }

    #[tokio::test]
    async fn test_deleted_inherited_table_is_hidden_remotely() {
        let store = MemoryObjectStore::new();
        let dir = TempDir::new().unwrap();
        let path = table(&dir, "000002.sst");

        let first = CloudEnv::open(dir.path(), options("db"), Arc::new(store.clone()), None)
            .await
            .unwrap();
        write(&first, &path, b"old").await;
        first.close().await.unwrap();
        drop(first);

        let env = CloudEnv::open(dir.path(), options("db"), Arc::new(store.clone()), None)
            .await
            .unwrap();
        assert!(env.file_exists(&path).await.unwrap());
        env.delete_file(&path).await.unwrap();
        assert!(!env.file_exists(&path).await.unwrap());
        let children = env.get_children(&dir.path().to_string_lossy()).await.unwrap();
        assert!(!children.contains(&"000002.sst".to_string()));

        write(&env, &path, b"new").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(read(&env, &path).await, b"new");
        assert_eq!(env.pending_deletions(), 0);
    }

    #[tokio::test]
    async fn test_reopen_claims_next_epoch() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let dir = TempDir::new().unwrap();
        let path = table(&dir, "000001.sst");

        let first = CloudEnv::open(dir.path(), options("db"), store.clone(), None)
            .await
            .unwrap();
        write(&first, &path, b"durable").await;
        assert!(first.is_authoritative().await.unwrap());

        let second = CloudEnv::open(dir.path(), options("db"), store.clone(), None)
            .await
            .unwrap();
        assert_eq!(second.open_kind(), OpenKind::Reopen);
        assert_eq!(second.dbid(), first.dbid());
        assert_eq!(second.epoch(), 2);
        assert_ne!(second.epoch_id(), first.epoch_id());
        assert!(!first.is_authoritative().await.unwrap());
        assert!(second.is_authoritative().await.unwrap());
        assert_eq!(read(&second, &path).await, b"durable");
    }

    #[tokio::test]
    async fn test_read_only_refuses_table_writes() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let dir = TempDir::new().unwrap();
        let path = table(&dir, "000001.sst");
        let writer = CloudEnv::open(dir.path(), options("db"), store.clone(), None)
            .await
            .unwrap();
        write(&writer, &path, b"shared").await;

        let reader_dir = TempDir::new().unwrap();
        let reader = CloudEnv::open_read_only(reader_dir.path(), options("db"), store, None)
            .await
            .unwrap();
        assert_eq!(reader.epoch(), 0);
        assert_eq!(read(&reader, &path).await, b"shared");
        let err = reader
            .new_writable_file(&path, &FileOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EnvError::NotSupported(_)));
        assert!(writer.is_authoritative().await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_and_link_refused_for_remote_roles() {
        let dir = TempDir::new().unwrap();
        let env = CloudEnv::open(dir.path(), options("db"), Arc::new(MemoryObjectStore::new()), None)
            .await
            .unwrap();
        let sst = table(&dir, "000001.sst");
        let other = table(&dir, "CURRENT");
        assert!(matches!(
            env.rename_file(&other, &sst).await.unwrap_err(),
            EnvError::NotSupported(_)
        ));
        assert!(matches!(
            env.link_file(&sst, &other).await.unwrap_err(),
            EnvError::NotSupported(_)
        ));

        std::fs::write(&other, b"MANIFEST-000001\n").unwrap();
        let renamed = table(&dir, "CURRENT.tmp");
        env.rename_file(&other, &renamed).await.unwrap();
        assert!(env.file_exists(&renamed).await.unwrap());
        assert!(!env.file_exists(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_dir_refused_while_remote_children_exist() {
        let dir = TempDir::new().unwrap();
        let env = CloudEnv::open(dir.path(), options("db"), Arc::new(MemoryObjectStore::new()), None)
            .await
            .unwrap();
        let db_dir = dir.path().to_string_lossy().into_owned();
        env.create_dir_if_missing(&db_dir).await.unwrap();

        let err = env.delete_dir(&db_dir).await.unwrap_err();
        assert!(matches!(err, EnvError::Io(_)));
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_log_segments_go_through_stream() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let log: Arc<dyn LogStream> = Arc::new(MemoryLogStream::new());
        let dir = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let opts = options("db")
            .with_log_stream("wal", cache.path())
            .with_tailer_poll_interval(Duration::from_millis(5));
        let env = CloudEnv::open(dir.path(), opts, store, Some(log))
            .await
            .unwrap();

        let path = table(&dir, "000005.log");
        let mut file = env
            .new_writable_file(&path, &FileOptions::default())
            .await
            .unwrap();
        assert!(matches!(file, WritableFile::TailedLogFile(_)));
        file.append(b"record one").await.unwrap();
        file.sync().await.unwrap();
        file.close().await.unwrap();

        for _ in 0..200 {
            if env.get_file_size(&path).await.unwrap() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut reader = env
            .new_sequential_file(&path, &FileOptions::default())
            .await
            .unwrap();
        assert!(matches!(reader, ReadableFile::TailedLogFile(_)));
        assert_eq!(&reader.read_to_end().await.unwrap()[..], b"record one");
        assert!(!Path::new(&path).exists());

        let nested = dir.path().join("sub").join("000006.log");
        let nested = nested.to_string_lossy();
        let mut file = env
            .new_writable_file(&nested, &FileOptions::default())
            .await
            .unwrap();
        file.append(b"nested").await.unwrap();
        file.close().await.unwrap();
        for _ in 0..200 {
            if env.file_exists(&nested).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let children = env.get_children(&dir.path().to_string_lossy()).await.unwrap();
        assert!(children.contains(&"000005.log".to_string()));
        assert!(!children.iter().any(|c| c.contains("000006.log")));
        let sub = env
            .get_children(&dir.path().join("sub").to_string_lossy())
            .await
            .unwrap();
        assert_eq!(sub, vec!["000006.log".to_string()]);

        env.close().await.unwrap();
        assert!(!env.tailer().unwrap().is_running());
    }

    #[tokio::test]
    async fn test_log_stream_required_when_logs_not_local() {
        let dir = TempDir::new().unwrap();
        let opts = options("db").with_log_stream("wal", dir.path().join("cache"));
        let err = CloudEnv::open(dir.path(), opts, Arc::new(MemoryObjectStore::new()), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EnvError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_local_fork_reads_source_and_writes_locally() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let master_dir = TempDir::new().unwrap();
        let master = CloudEnv::open(master_dir.path(), options("db"), store.clone(), None)
            .await
            .unwrap();
        write(&master, &table(&master_dir, "000001.sst"), b"base").await;
        master.close().await.unwrap();

        let fork_dir = TempDir::new().unwrap();
        let opts = options("db").with_dest(Default::default());
        let fork = CloudEnv::open(fork_dir.path(), opts, store.clone(), None)
            .await
            .unwrap();
        assert_eq!(fork.open_kind(), OpenKind::LocalFork);
        assert!(fork.keeps_local_table_files());
        assert_eq!(read(&fork, &table(&fork_dir, "000001.sst")).await, b"base");

        write(&fork, &table(&fork_dir, "000002.sst"), b"fork only").await;
        let children = fork.get_children(&fork_dir.path().to_string_lossy()).await.unwrap();
        assert!(children.contains(&"000001.sst".to_string()));
        assert!(children.contains(&"000002.sst".to_string()));

        let master_again = CloudEnv::open_read_only(master_dir.path(), options("db"), store, None)
            .await
            .unwrap();
        assert!(!master_again
            .file_exists(&table(&master_dir, "000002.sst"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_local_fork_recreated_table_survives_grace() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let master_dir = TempDir::new().unwrap();
        let master = CloudEnv::open(master_dir.path(), options("db"), store.clone(), None)
            .await
            .unwrap();
        write(&master, &table(&master_dir, "000001.sst"), b"base").await;
        master.close().await.unwrap();

        let fork_dir = TempDir::new().unwrap();
        let opts = options("db").with_dest(Default::default());
        let fork = CloudEnv::open(fork_dir.path(), opts, store.clone(), None)
            .await
            .unwrap();
        let path = table(&fork_dir, "000001.sst");
        assert_eq!(read(&fork, &path).await, b"base");

        fork.delete_file(&path).await.unwrap();
        assert!(!fork.file_exists(&path).await.unwrap());
        let children = fork.get_children(&fork_dir.path().to_string_lossy()).await.unwrap();
        assert!(!children.contains(&"000001.sst".to_string()));

        write(&fork, &path, b"new bytes").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(Path::new(&path).exists());
        assert!(fork.file_exists(&path).await.unwrap());
        assert_eq!(read(&fork, &path).await, b"new bytes");

        let master_again = CloudEnv::open_read_only(master_dir.path(), options("db"), store, None)
            .await
            .unwrap();
        assert_eq!(read(&master_again, &table(&master_dir, "000001.sst")).await, b"base");
    }
}
