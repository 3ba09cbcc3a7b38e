//! Advisory garbage collection over a bucket
//!
//! Scans never delete anything. Listings are eventually consistent and other
//! instances may be mid-claim, so the caller decides when it is safe to pass
//! a scan's findings to the explicit delete calls.

use crate::classifier::{classify, FileRole};
use crate::error::{EnvError, Result};
use crate::options::RemoteLocation;
use crate::ownership::{logical_name, ManifestBackend, OwnershipManifest, GENERATION_PREFIX};
use crate::registry::{DbIdentity, DbidRegistry};
use crate::retry::RetryExecutor;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use stratus_store::{list_all, ObjectStore};
use tracing::{info, instrument, warn};

/// Scans one bucket for unreachable files and dead registry entries
#[derive(Clone)]
pub struct GarbageCollector {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    registry: DbidRegistry,
    page_size: usize,
}

impl GarbageCollector {
    /// Collector for `bucket` (full name)
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryExecutor, bucket: impl Into<String>) -> Self {
        let registry = DbidRegistry::new(store.clone(), retry.clone(), bucket);
        Self {
            store,
            retry,
            registry,
            page_size: stratus_store::DEFAULT_LIST_PAGE_SIZE,
        }
    }

    /// Set the listing page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self.registry = self.registry.with_page_size(page_size);
        self
    }

    /// Bucket being scanned
    pub fn bucket(&self) -> &str {
        self.registry.bucket()
    }

    /// Registry of the bucket
    pub fn registry(&self) -> &DbidRegistry {
        &self.registry
    }

    fn manifest(&self, path: &str) -> OwnershipManifest {
        OwnershipManifest::new(
            ManifestBackend::Remote {
                store: self.store.clone(),
                retry: self.retry.clone(),
                location: RemoteLocation::new(self.bucket(), path),
            },
            "gc",
        )
    }

    /// Table and generation files not reachable from any live generation
    ///
    /// Reachability spans the whole bucket: a clone's generation may refer to
    /// table files stored under its source's prefix.
    #[instrument(skip(self), fields(bucket = %self.bucket()))]
    pub async fn find_obsolete_files(&self) -> Result<Vec<String>> {
        let entries = self.registry.list().await?;
        let prefixes: BTreeSet<String> = entries
            .iter()
            .map(|e| RemoteLocation::new(self.bucket(), &e.path).prefix)
            .collect();

        let mut reachable: HashSet<String> = HashSet::new();
        let mut current_generation: HashMap<String, String> = HashMap::new();
        for prefix in &prefixes {
            match self.manifest(prefix).authoritative().await {
                Ok(Some(claim)) => {
                    reachable.extend(claim.generation.files.values().cloned());
                    current_generation.insert(prefix.clone(), claim.pointer.generation);
                }
                Ok(None) => {}
                Err(e) if e.is_not_found() => {
                    warn!(prefix = %prefix, error = %e, "Pointer names a missing generation");
                }
                Err(e) => return Err(e),
            }
        }

        let mut obsolete = Vec::new();
        for prefix in &prefixes {
            let location = RemoteLocation::new(self.bucket(), prefix);
            let listing_prefix = location.listing_prefix();
            let (store, bucket, page_size) = (&self.store, self.bucket(), self.page_size);
            let lp = listing_prefix.as_str();
            let keys = self
                .retry
                .remote("gc list", || async move {
                    Ok::<_, EnvError>(list_all(&**store, bucket, lp, page_size).await?)
                })
                .await?;

            for key in keys {
                let name = &key[listing_prefix.len()..];
                if name.contains('/') {
                    continue;
                }
                let dead = if classify(logical_name(name)) == FileRole::TableFile {
                    !reachable.contains(name)
                } else if name.starts_with(GENERATION_PREFIX) {
                    current_generation.get(prefix).map(String::as_str) != Some(name)
                } else {
                    false
                };
                if dead {
                    obsolete.push(key.clone());
                }
            }
        }
        obsolete.sort();
        info!(count = obsolete.len(), "Obsolete file scan finished");
        Ok(obsolete)
    }

    /// Registry entries whose location has no ownership pointer
    #[instrument(skip(self), fields(bucket = %self.bucket()))]
    pub async fn find_obsolete_dbids(&self) -> Result<Vec<DbIdentity>> {
        let mut obsolete = Vec::new();
        for entry in self.registry.list().await? {
            if self.manifest(&entry.path).pointer().await?.is_none() {
                obsolete.push(entry);
            }
        }
        info!(count = obsolete.len(), "Obsolete dbid scan finished");
        Ok(obsolete)
    }

    /// Delete objects by key; keys already gone are skipped
    pub async fn delete_objects(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            let (store, bucket, key) = (&self.store, self.bucket(), key.as_str());
            let result = self
                .retry
                .remote("gc delete", || async move {
                    store.delete_object(bucket, key).await?;
                    Ok::<_, EnvError>(())
                })
                .await;
            match result {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        info!(bucket = %self.bucket(), deleted, "Deleted obsolete objects");
        Ok(deleted)
    }

    /// Remove registry entries; entries already gone are skipped
    pub async fn delete_dbids(&self, dbids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for dbid in dbids {
            match self.registry.remove(dbid).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}
