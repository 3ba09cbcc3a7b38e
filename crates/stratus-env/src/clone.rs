//! Fork-on-open and savepoints
//!
//! An environment reads from a source location and writes to a destination.
//! When the two differ the database is a fork: files missing from the
//! destination are read from the source, and nothing is ever written to the
//! source. An empty destination makes a local-only fork whose writes stay on
//! local disk. A savepoint copies every live file still living only in the
//! source up to the destination, after which the fork no longer depends on it.

use crate::error::{EnvError, Result};
use crate::options::RemoteLocation;
use crate::ownership::{Generation, ManifestBackend, OwnershipManifest};
use crate::registry::{clone_dbid, new_dbid, DbIdentity, DbidRegistry, DBID_FILE};
use crate::remote_file::probe;
use crate::retry::RetryExecutor;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use stratus_store::{ObjectMeta, ObjectStore};
use tracing::{debug, info, instrument};

/// Concurrent copies issued by a savepoint
const SAVEPOINT_CONCURRENCY: usize = 8;

/// How an environment came to its identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OpenKind {
    /// No identity existed at the source or destination
    NewDatabase,
    /// The destination already carried an identity
    Reopen,
    /// A new destination seeded from a different source
    Clone,
    /// No destination; local sandbox over the source
    LocalFork,
}

/// Identity decided at open time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// Database identity
    pub dbid: String,
    /// How it was obtained
    pub kind: OpenKind,
}

/// Outcome of a savepoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SavepointReport {
    /// Physical names copied from source to destination
    pub copied: Vec<String>,
    /// Files already present at the destination
    pub skipped: usize,
}

/// Resolves identities, source fallback and savepoints for one environment
#[derive(Clone)]
pub struct CloneCoordinator {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    src: Option<RemoteLocation>,
    dest: Option<RemoteLocation>,
}

impl CloneCoordinator {
    /// Coordinator for a source and destination
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        src: Option<RemoteLocation>,
        dest: Option<RemoteLocation>,
    ) -> Self {
        Self {
            store,
            retry,
            src,
            dest,
        }
    }

    /// Source location
    pub fn src(&self) -> Option<&RemoteLocation> {
        self.src.as_ref()
    }

    /// Destination location
    pub fn dest(&self) -> Option<&RemoteLocation> {
        self.dest.as_ref()
    }

    /// Whether reads may fall back to a source distinct from the destination
    pub fn is_fork(&self) -> bool {
        self.src.is_some() && self.src != self.dest
    }

    fn remote_backend(&self, location: &RemoteLocation) -> ManifestBackend {
        ManifestBackend::Remote {
            store: self.store.clone(),
            retry: self.retry.clone(),
            location: location.clone(),
        }
    }

    async fn read_dbid(backend: &ManifestBackend) -> Result<Option<String>> {
        match backend.read(DBID_FILE).await? {
            Some(data) => {
                let identity: DbIdentity = serde_json::from_slice(&data)?;
                Ok(Some(identity.dbid))
            }
            None => Ok(None),
        }
    }

    async fn write_dbid(backend: &ManifestBackend, identity: &DbIdentity) -> Result<()> {
        let data = serde_json::to_vec(identity)?;
        backend.write(DBID_FILE, Bytes::from(data)).await
    }

    /// Decide the identity of the database being opened
    ///
    /// Reopening a destination keeps its identity, a new destination cloned
    /// from a source gets a derived identity, and a local-only fork shares
    /// the source's identity.
    #[instrument(skip(self, local_dir))]
    pub async fn resolve_identity(&self, local_dir: &Path) -> Result<Resolution> {
        let src_dbid = match &self.src {
            Some(src) if self.is_fork() => Self::read_dbid(&self.remote_backend(src)).await?,
            _ => None,
        };

        let (backend, identity_home) = match &self.dest {
            Some(dest) => (
                self.remote_backend(dest),
                (dest.bucket.clone(), dest.prefix.clone()),
            ),
            None => (
                ManifestBackend::Local {
                    dir: local_dir.to_path_buf(),
                },
                (String::new(), local_dir.display().to_string()),
            ),
        };

        let resolution = match Self::read_dbid(&backend).await? {
            Some(dbid) => Resolution {
                dbid,
                kind: OpenKind::Reopen,
            },
            None => {
                let resolution = match (src_dbid, self.dest.is_some()) {
                    (Some(parent), true) => Resolution {
                        dbid: clone_dbid(&parent),
                        kind: OpenKind::Clone,
                    },
                    (Some(parent), false) => Resolution {
                        dbid: parent,
                        kind: OpenKind::LocalFork,
                    },
                    (None, _) => Resolution {
                        dbid: new_dbid(),
                        kind: OpenKind::NewDatabase,
                    },
                };
                let identity = DbIdentity {
                    dbid: resolution.dbid.clone(),
                    bucket: identity_home.0.clone(),
                    path: identity_home.1.clone(),
                };
                Self::write_dbid(&backend, &identity).await?;
                resolution
            }
        };

        if let Some(dest) = &self.dest {
            DbidRegistry::new(self.store.clone(), self.retry.clone(), dest.bucket.clone())
                .register(&resolution.dbid, &dest.prefix)
                .await?;
        }
        info!(dbid = %resolution.dbid, kind = ?resolution.kind, "Resolved database identity");
        Ok(resolution)
    }

    /// Authoritative generation of the source, when forking
    pub async fn source_generation(&self) -> Result<Option<Generation>> {
        let Some(src) = self.src.as_ref().filter(|_| self.is_fork()) else {
            return Ok(None);
        };
        let manifest = OwnershipManifest::new(self.remote_backend(src), "reader");
        Ok(manifest.authoritative().await?.map(|claim| claim.generation))
    }

    /// Find a physical file, destination first, then source
    pub async fn locate(&self, physical: &str) -> Result<Option<(RemoteLocation, ObjectMeta)>> {
        let candidates = self
            .dest
            .iter()
            .chain(self.src.iter().filter(|_| self.is_fork()));
        for location in candidates {
            match probe(&self.store, &self.retry, &location.bucket, &location.key(physical)).await {
                Ok(meta) => return Ok(Some((location.clone(), meta))),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Copy every file of `generation` missing at the destination from the source
    #[instrument(skip(self, generation), fields(live_files = generation.files.len()))]
    pub async fn savepoint(&self, generation: &Generation) -> Result<SavepointReport> {
        let Some(dest) = &self.dest else {
            return Err(EnvError::InvalidArgument(
                "savepoint requires a destination bucket".into(),
            ));
        };
        let Some(src) = self.src.as_ref().filter(|_| self.is_fork()) else {
            return Ok(SavepointReport::default());
        };

        let outcomes: Vec<Option<String>> = stream::iter(generation.files.values())
            .map(|physical| async move {
                let dest_key = dest.key(physical);
                match probe(&self.store, &self.retry, &dest.bucket, &dest_key).await {
                    Ok(_) => return Ok(None),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                let src_key = src.key(physical);
                let (store, dest_key) = (&self.store, dest_key.as_str());
                let src_key = src_key.as_str();
                self.retry
                    .remote("savepoint copy", || async move {
                        store
                            .copy_object(&src.bucket, src_key, &dest.bucket, dest_key)
                            .await?;
                        Ok::<_, EnvError>(())
                    })
                    .await?;
                debug!(file = %physical, "Copied to destination");
                Ok::<_, EnvError>(Some(physical.clone()))
            })
            .buffer_unordered(SAVEPOINT_CONCURRENCY)
            .try_collect()
            .await?;

        let mut report = SavepointReport::default();
        for outcome in outcomes {
            match outcome {
                Some(physical) => report.copied.push(physical),
                None => report.skipped += 1,
            }
        }
        report.copied.sort();
        info!(
            copied = report.copied.len(),
            skipped = report.skipped,
            "Savepoint finished"
        );
        Ok(report)
    }
}
