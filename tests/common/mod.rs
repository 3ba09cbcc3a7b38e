//! Shared helpers for end-to-end tests
//!
//! `MiniDb` is a toy key-value engine that drives a `CloudEnv` the way an LSM
//! engine does: puts go to a memtable, flushes write numbered table files and
//! reads consult table files newest first.

#![allow(dead_code)]

use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stratus_env::{classify, CloudEnv, CloudEnvOptions, FileOptions, FileRole};
use stratus_store::ObjectStore;

/// Bucket every test uses, before the prefix is applied
pub const BUCKET: &str = "b";

/// Install a test subscriber once
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_env=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Options for `path` in the test bucket with short timeouts
pub fn options(path: &str) -> CloudEnvOptions {
    CloudEnvOptions::new(BUCKET, path)
        .with_retry(Duration::from_millis(500), Duration::from_millis(10))
        .with_file_deletion_delay(Duration::from_millis(200))
}

/// Read a whole object straight from the store
pub async fn fetch(store: &Arc<dyn ObjectStore>, bucket: &str, key: &str) -> Bytes {
    let size = store.get_range(bucket, key, 0, 0).await.unwrap().object.size;
    store.get_range(bucket, key, 0, size).await.unwrap().data
}

/// Table number of a file name like `000012.sst`
fn table_number(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

/// A toy engine over a cloud environment
pub struct MiniDb {
    env: CloudEnv,
    dir: String,
    memtable: BTreeMap<String, String>,
    next_file: u64,
}

impl MiniDb {
    /// Attach to an opened environment
    pub async fn open(env: CloudEnv) -> anyhow::Result<Self> {
        let dir = env.local_dir().to_string_lossy().into_owned();
        let next_file = env
            .get_children(&dir)
            .await?
            .iter()
            .filter_map(|name| table_number(name))
            .max()
            .map_or(1, |n| n + 1);
        Ok(Self {
            env,
            dir,
            memtable: BTreeMap::new(),
            next_file,
        })
    }

    /// The underlying environment
    pub fn env(&self) -> &CloudEnv {
        &self.env
    }

    /// Path of table file `number`
    pub fn table_path(&self, number: u64) -> String {
        Path::new(&self.dir)
            .join(format!("{:06}.sst", number))
            .to_string_lossy()
            .into_owned()
    }

    /// Buffer a write
    pub fn put(&mut self, key: &str, value: &str) {
        self.memtable.insert(key.to_string(), value.to_string());
    }

    /// Write the memtable as a new table file and return its path
    pub async fn flush(&mut self) -> anyhow::Result<String> {
        let path = self.table_path(self.next_file);
        self.next_file += 1;
        let mut file = self
            .env
            .new_writable_file(&path, &FileOptions::default())
            .await?;
        file.append(&serde_json::to_vec(&self.memtable)?).await?;
        file.sync().await?;
        file.close().await?;
        self.memtable.clear();
        Ok(path)
    }

    /// Look a key up in the memtable, then in table files newest first
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        if let Some(value) = self.memtable.get(key) {
            return Ok(Some(value.clone()));
        }
        let mut tables: Vec<u64> = self
            .env
            .get_children(&self.dir)
            .await?
            .iter()
            .filter(|name| classify(name) == FileRole::TableFile)
            .filter_map(|name| table_number(name))
            .collect();
        tables.sort_unstable_by(|a, b| b.cmp(a));

        for number in tables {
            let mut file = self
                .env
                .new_random_access_file(&self.table_path(number), &FileOptions::default())
                .await?;
            let rows: BTreeMap<String, String> = serde_json::from_slice(&file.read_to_end().await?)?;
            if let Some(value) = rows.get(key) {
                return Ok(Some(value.clone()));
            }
        }
        Ok(None)
    }

    /// Flush pending writes and close the environment
    pub async fn close(mut self) -> anyhow::Result<()> {
        if !self.memtable.is_empty() {
            self.flush().await?;
        }
        self.env.close().await?;
        Ok(())
    }
}
