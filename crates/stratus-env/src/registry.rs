//! Database identities and the per-bucket dbid registry

use crate::error::{EnvError, Result};
use crate::retry::RetryExecutor;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use stratus_store::{list_all, ObjectStore};
use tracing::{debug, instrument};

/// Key prefix of registry entries inside a bucket
pub const REGISTRY_PREFIX: &str = ".dbid/";

/// File holding the dbid of the database at a location
pub const DBID_FILE: &str = "DBID";

/// Separator between a parent dbid and a clone suffix
pub const CLONE_SEPARATOR: &str = "~clone~";

/// Identity of a fresh database
pub fn new_dbid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Identity of a clone of `parent`
pub fn clone_dbid(parent: &str) -> String {
    format!("{}{}{}", parent, CLONE_SEPARATOR, uuid::Uuid::new_v4().simple())
}

/// Ancestors of each dbid, nearest first
pub fn extract_parents<'a>(
    dbids: impl IntoIterator<Item = &'a str>,
) -> BTreeMap<String, Vec<String>> {
    dbids
        .into_iter()
        .map(|dbid| {
            let mut parents: Vec<String> = dbid
                .match_indices(CLONE_SEPARATOR)
                .map(|(i, _)| dbid[..i].to_string())
                .collect();
            parents.reverse();
            (dbid.to_string(), parents)
        })
        .collect()
}

/// A registered database: its dbid and where it lives
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbIdentity {
    /// Database identity
    pub dbid: String,
    /// Full bucket name
    pub bucket: String,
    /// Key prefix inside the bucket
    pub path: String,
}

/// Registry of the databases stored in one bucket
#[derive(Clone)]
pub struct DbidRegistry {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    bucket: String,
    page_size: usize,
}

impl DbidRegistry {
    /// Registry of `bucket` (full name)
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryExecutor, bucket: impl Into<String>) -> Self {
        Self {
            store,
            retry,
            bucket: bucket.into(),
            page_size: stratus_store::DEFAULT_LIST_PAGE_SIZE,
        }
    }

    /// Set the listing page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Bucket this registry describes
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key(dbid: &str) -> String {
        format!("{}{}", REGISTRY_PREFIX, dbid)
    }

    /// Record where a dbid lives
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn register(&self, dbid: &str, path: &str) -> Result<()> {
        let entry = DbIdentity {
            dbid: dbid.to_string(),
            bucket: self.bucket.clone(),
            path: path.to_string(),
        };
        let data = Bytes::from(serde_json::to_vec(&entry)?);
        let key = Self::key(dbid);
        let (store, bucket, key) = (&self.store, self.bucket.as_str(), key.as_str());
        self.retry
            .remote("dbid register", || {
                let data = data.clone();
                async move {
                    store.put_object(bucket, key, data).await?;
                    Ok::<_, EnvError>(())
                }
            })
            .await?;
        debug!(dbid = %dbid, path = %path, "Registered dbid");
        Ok(())
    }

    /// Find where a dbid lives
    pub async fn lookup(&self, dbid: &str) -> Result<Option<DbIdentity>> {
        let key = Self::key(dbid);
        let (store, bucket, key) = (&self.store, self.bucket.as_str(), key.as_str());
        let result = self
            .retry
            .remote("dbid lookup", || async move {
                let head = store.get_range(bucket, key, 0, 0).await?;
                let body = store.get_range(bucket, key, 0, head.object.size).await?;
                Ok::<_, EnvError>(body.data)
            })
            .await;
        match result {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every registered database; listings may lag recent registrations
    pub async fn list(&self) -> Result<Vec<DbIdentity>> {
        let (store, bucket, page_size) = (&self.store, self.bucket.as_str(), self.page_size);
        let keys = self
            .retry
            .remote("dbid list", || async move {
                Ok::<_, EnvError>(list_all(&**store, bucket, REGISTRY_PREFIX, page_size).await?)
            })
            .await?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let dbid = &key[REGISTRY_PREFIX.len()..];
            if let Some(entry) = self.lookup(dbid).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Remove a registry entry
    pub async fn remove(&self, dbid: &str) -> Result<()> {
        let key = Self::key(dbid);
        let (store, bucket, key) = (&self.store, self.bucket.as_str(), key.as_str());
        self.retry
            .remote("dbid remove", || async move {
                store.delete_object(bucket, key).await?;
                Ok::<_, EnvError>(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stratus_store::MemoryObjectStore;

    async fn registry() -> DbidRegistry {
        let mem = MemoryObjectStore::new();
        mem.create_bucket("stratus.b").await.unwrap();
        DbidRegistry::new(
            Arc::new(mem),
            RetryExecutor::new(Duration::from_millis(200), Duration::from_millis(5)),
            "stratus.b",
        )
        .with_page_size(2)
    }

    #[test]
    fn test_clone_lineage() {
        let root = new_dbid();
        let child = clone_dbid(&root);
        let grandchild = clone_dbid(&child);
        let parents = extract_parents([root.as_str(), child.as_str(), grandchild.as_str()]);
        assert!(parents[&root].is_empty());
        assert_eq!(parents[&child], vec![root.clone()]);
        assert_eq!(parents[&grandchild], vec![child.clone(), root.clone()]);
    }

    #[tokio::test]
    async fn test_register_lookup_list_remove() {
        let registry = registry().await;
        for (dbid, path) in [("a", "p1"), ("b", "p2"), ("c", "p3")] {
            registry.register(dbid, path).await.unwrap();
        }

        let found = registry.lookup("b").await.unwrap().unwrap();
        assert_eq!(found.path, "p2");
        assert_eq!(found.bucket, "stratus.b");
        assert!(registry.lookup("zzz").await.unwrap().is_none());

        let all = registry.list().await.unwrap();
        assert_eq!(all.len(), 3);

        registry.remove("a").await.unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 2);
        assert!(registry.remove("a").await.unwrap_err().is_not_found());
    }
}
