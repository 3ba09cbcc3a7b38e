//! Ownership pointer and metadata generations
//!
//! Every instance that opens a database for writing gets its own metadata
//! generation, `GENERATION-<epoch_id>`, mapping logical table file names to
//! the physical names their bytes are stored under. The `OWNERSHIP` pointer
//! names the generation that is authoritative:
//!
//! ```text
//!   OWNERSHIP { epoch: 7, generation: "GENERATION-9c41..", writer: "..." }
//!        │
//!        ▼
//!   GENERATION-9c41.. { files: { "000012.sst": "000012.sst-9c41..", ... } }
//! ```
//!
//! Claiming is last-writer-wins. Two instances that read the same epoch both
//! write `epoch + 1`; the pointer write that lands last is the one every later
//! open honors, and the other instance's subsequent writes are invisible to
//! them. There is no compare-and-swap on the pointer.

use crate::classifier::TABLE_SUFFIX;
use crate::error::{EnvError, Result};
use crate::options::RemoteLocation;
use crate::remote_file::TableFileListener;
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use stratus_store::ObjectStore;
use tracing::{debug, info, instrument};

/// Name of the pointer file
pub const POINTER_FILE: &str = "OWNERSHIP";

/// Prefix of metadata generation files
pub const GENERATION_PREFIX: &str = "GENERATION-";

/// On-store format version of pointer and generation files
pub const FORMAT_VERSION: u32 = 1;

/// Generate a fresh epoch id
pub fn new_epoch_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Name of the generation file written under `epoch_id`
pub fn generation_file(epoch_id: &str) -> String {
    format!("{}{}", GENERATION_PREFIX, epoch_id)
}

/// Physical name of a table file written under `epoch_id`
pub fn physical_name(logical: &str, epoch_id: &str) -> String {
    if epoch_id.is_empty() {
        logical.to_string()
    } else {
        format!("{}-{}", logical, epoch_id)
    }
}

/// Logical name of a physical table file name
pub fn logical_name(physical: &str) -> &str {
    match physical.rfind(TABLE_SUFFIX) {
        Some(i) if physical[i + TABLE_SUFFIX.len()..].starts_with('-') => {
            &physical[..i + TABLE_SUFFIX.len()]
        }
        _ => physical,
    }
}

/// The versioned reference to the authoritative generation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipPointer {
    /// Format version
    pub format_version: u32,
    /// Monotonically increasing claim counter
    pub epoch: u64,
    /// File name of the authoritative generation
    pub generation: String,
    /// Identity of the instance that wrote this pointer
    pub writer: String,
    /// When the pointer was written
    pub updated_at: DateTime<Utc>,
}

/// A metadata generation: the live table files of one writer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Format version
    pub format_version: u32,
    /// Epoch id of the writer that owns this generation
    pub epoch_id: String,
    /// Database identity
    pub dbid: String,
    /// Logical table file name to physical name
    pub files: BTreeMap<String, String>,
    /// When the generation was first written
    pub created_at: DateTime<Utc>,
}

impl Generation {
    /// An empty generation
    pub fn new(epoch_id: impl Into<String>, dbid: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            epoch_id: epoch_id.into(),
            dbid: dbid.into(),
            files: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// A successor inheriting this generation's live files
    pub fn successor(&self, epoch_id: impl Into<String>, dbid: impl Into<String>) -> Self {
        Self {
            files: self.files.clone(),
            ..Self::new(epoch_id, dbid)
        }
    }

    /// File name of this generation
    pub fn file_name(&self) -> String {
        generation_file(&self.epoch_id)
    }
}

/// Claim state of a database location
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnershipState {
    /// No pointer has been written yet
    Unclaimed,
    /// Some instance has claimed the location
    Owned { epoch: u64, writer: String },
}

/// Where pointer and generation files live
#[derive(Clone)]
pub enum ManifestBackend {
    /// Under a remote location
    Remote {
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        location: RemoteLocation,
    },
    /// In a local directory (local-only forks)
    Local { dir: PathBuf },
}

impl ManifestBackend {
    /// Read a metadata file; `None` when absent
    pub async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        let result = match self {
            ManifestBackend::Remote {
                store,
                retry,
                location,
            } => {
                let key = location.key(name);
                let bucket = location.bucket.as_str();
                let key = key.as_str();
                retry
                    .remote("metadata read", || async move {
                        let head = store.get_range(bucket, key, 0, 0).await?;
                        let body = store.get_range(bucket, key, 0, head.object.size).await?;
                        Ok::<_, EnvError>(body.data)
                    })
                    .await
            }
            ManifestBackend::Local { dir } => tokio::fs::read(dir.join(name))
                .await
                .map(Bytes::from)
                .map_err(EnvError::from),
        };
        match result {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write a metadata file, replacing any previous content
    pub async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        match self {
            ManifestBackend::Remote {
                store,
                retry,
                location,
            } => {
                let key = location.key(name);
                let bucket = location.bucket.as_str();
                let key = key.as_str();
                retry
                    .remote("metadata write", || {
                        let data = data.clone();
                        async move {
                            store.put_object(bucket, key, data).await?;
                            Ok::<_, EnvError>(())
                        }
                    })
                    .await
            }
            ManifestBackend::Local { dir } => {
                tokio::fs::create_dir_all(dir).await?;
                let staging = dir.join(format!(".{}.tmp", name));
                tokio::fs::write(&staging, &data).await?;
                tokio::fs::rename(&staging, dir.join(name)).await?;
                Ok(())
            }
        }
    }

    /// Whether this backend is remote
    pub fn is_remote(&self) -> bool {
        matches!(self, ManifestBackend::Remote { .. })
    }
}

/// Result of a successful claim
#[derive(Clone, Debug)]
pub struct Claim {
    /// The pointer this instance wrote
    pub pointer: OwnershipPointer,
    /// The generation it points at
    pub generation: Generation,
}

/// Reads and writes the ownership pointer of one database location
#[derive(Clone)]
pub struct OwnershipManifest {
    backend: ManifestBackend,
    writer: String,
}

impl OwnershipManifest {
    /// Create a manifest handle; `writer` identifies this instance
    pub fn new(backend: ManifestBackend, writer: impl Into<String>) -> Self {
        Self {
            backend,
            writer: writer.into(),
        }
    }

    /// Identity written into pointers claimed by this handle
    pub fn writer(&self) -> &str {
        &self.writer
    }

    /// Storage backend
    pub fn backend(&self) -> &ManifestBackend {
        &self.backend
    }

    /// Read the current pointer
    pub async fn pointer(&self) -> Result<Option<OwnershipPointer>> {
        match self.backend.read(POINTER_FILE).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Current claim state
    pub async fn state(&self) -> Result<OwnershipState> {
        Ok(match self.pointer().await? {
            Some(p) => OwnershipState::Owned {
                epoch: p.epoch,
                writer: p.writer,
            },
            None => OwnershipState::Unclaimed,
        })
    }

    /// Load a generation file by name
    pub async fn load_generation(&self, name: &str) -> Result<Generation> {
        match self.backend.read(name).await? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Err(EnvError::NotFound(format!("metadata generation {}", name))),
        }
    }

    /// Pointer and generation currently authoritative, without claiming
    pub async fn authoritative(&self) -> Result<Option<Claim>> {
        let Some(pointer) = self.pointer().await? else {
            return Ok(None);
        };
        let generation = self.load_generation(&pointer.generation).await?;
        Ok(Some(Claim {
            pointer,
            generation,
        }))
    }

    /// Persist a generation under its own file name
    pub async fn write_generation(&self, generation: &Generation) -> Result<()> {
        let data = serde_json::to_vec_pretty(generation)?;
        self.backend
            .write(&generation.file_name(), Bytes::from(data))
            .await
    }

    /// Claim a location that has never been claimed
    pub async fn create(&self, dbid: &str) -> Result<Claim> {
        if let Some(pointer) = self.pointer().await? {
            return Err(EnvError::InvalidArgument(format!(
                "location already claimed at epoch {} by {}",
                pointer.epoch, pointer.writer
            )));
        }
        self.claim_for_write(dbid, None).await
    }

    /// Become the authoritative writer
    ///
    /// The new generation inherits the live files of the currently
    /// authoritative one, or of `seed` when the location is unclaimed. The
    /// generation is written before the pointer, and the pointer write
    /// completes before this returns.
    #[instrument(skip(self, seed), fields(writer = %self.writer))]
    pub async fn claim_for_write(&self, dbid: &str, seed: Option<&Generation>) -> Result<Claim> {
        let previous = self.authoritative().await?;
        let epoch_id = new_epoch_id();
        let (epoch, generation) = match &previous {
            Some(claim) => (claim.pointer.epoch + 1, claim.generation.successor(&*epoch_id, dbid)),
            None => match seed {
                Some(seed) => (1, seed.successor(&*epoch_id, dbid)),
                None => (1, Generation::new(&*epoch_id, dbid)),
            },
        };
        self.write_generation(&generation).await?;

        let pointer = OwnershipPointer {
            format_version: FORMAT_VERSION,
            epoch,
            generation: generation.file_name(),
            writer: self.writer.clone(),
            updated_at: Utc::now(),
        };
        let data = serde_json::to_vec_pretty(&pointer)?;
        self.backend.write(POINTER_FILE, Bytes::from(data)).await?;
        info!(
            epoch,
            generation = %pointer.generation,
            live_files = generation.files.len(),
            "Claimed ownership"
        );
        Ok(Claim {
            pointer,
            generation,
        })
    }
}

/// The live table files of a running instance
///
/// Updated as table files close and are deleted; every change is persisted to
/// the instance's own generation file. Persisting never touches the pointer.
pub struct GenerationTracker {
    manifest: Option<OwnershipManifest>,
    current: RwLock<Generation>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl GenerationTracker {
    /// Track `generation`, persisting through `manifest` when given
    pub fn new(generation: Generation, manifest: Option<OwnershipManifest>) -> Self {
        Self {
            manifest,
            current: RwLock::new(generation),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Epoch id new table files are written under
    pub fn epoch_id(&self) -> String {
        self.current.read().epoch_id.clone()
    }

    /// Physical name of a live logical table file
    pub fn resolve(&self, logical: &str) -> Option<String> {
        self.current.read().files.get(logical).cloned()
    }

    /// Copy of the current generation
    pub fn snapshot(&self) -> Generation {
        self.current.read().clone()
    }

    /// Whether changes are persisted
    pub fn is_persistent(&self) -> bool {
        self.manifest.is_some()
    }

    /// Mark a table file live
    pub async fn record_live(&self, logical: &str, physical: &str) -> Result<()> {
        self.current
            .write()
            .files
            .insert(logical.to_string(), physical.to_string());
        self.persist().await
    }

    /// Drop a table file from the live set; returns its physical name
    pub async fn remove(&self, logical: &str) -> Result<Option<String>> {
        let removed = self.current.write().files.remove(logical);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Write the current generation
    pub async fn persist(&self) -> Result<()> {
        let Some(manifest) = &self.manifest else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        manifest.write_generation(&snapshot).await?;
        debug!(
            generation = %snapshot.file_name(),
            live_files = snapshot.files.len(),
            "Persisted generation"
        );
        Ok(())
    }
}

#[async_trait]
impl TableFileListener for GenerationTracker {
    async fn table_file_closed(&self, logical: &str, physical: &str, _size: u64) -> Result<()> {
        self.record_live(logical, physical).await
    }
}
