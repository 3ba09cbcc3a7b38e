//! Subcommand implementations
//!
//! Each command returns a JSON value that `main` prints.

use crate::config::AdminConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use stratus_env::ownership::ManifestBackend;
use stratus_env::{
    CloneCoordinator, DbidRegistry, GarbageCollector, OwnershipManifest, RemoteLocation,
};
use stratus_store::ObjectStore;
use tracing::info;

/// Writer identity used by read-only manifest handles
const ADMIN_WRITER: &str = "stratus-admin";

/// Every database registered in the bucket
pub async fn dbids(store: Arc<dyn ObjectStore>, config: &AdminConfig) -> anyhow::Result<Value> {
    let registry = DbidRegistry::new(store, config.retry(), config.bucket()?)
        .with_page_size(config.list_page_size);
    Ok(serde_json::to_value(registry.list().await?)?)
}

/// The ownership pointer of a database path
pub async fn pointer(
    store: Arc<dyn ObjectStore>,
    config: &AdminConfig,
    path: &str,
) -> anyhow::Result<Value> {
    let backend = ManifestBackend::Remote {
        store,
        retry: config.retry(),
        location: RemoteLocation::new(config.bucket()?, path),
    };
    let manifest = OwnershipManifest::new(backend, ADMIN_WRITER);
    Ok(serde_json::to_value(manifest.pointer().await?)?)
}

fn collector(store: Arc<dyn ObjectStore>, config: &AdminConfig) -> anyhow::Result<GarbageCollector> {
    Ok(GarbageCollector::new(store, config.retry(), config.bucket()?)
        .with_page_size(config.list_page_size))
}

/// Unreachable table and generation files, optionally deleted
pub async fn obsolete_files(
    store: Arc<dyn ObjectStore>,
    config: &AdminConfig,
    purge: bool,
) -> anyhow::Result<Value> {
    let gc = collector(store, config)?;
    let obsolete = gc.find_obsolete_files().await?;
    let deleted = if purge {
        let deleted = gc.delete_objects(&obsolete).await?;
        info!(bucket = %gc.bucket(), deleted, "Purged obsolete files");
        deleted
    } else {
        0
    };
    Ok(json!({ "obsolete": obsolete, "deleted": deleted }))
}

/// Registered databases without a pointer, optionally unregistered
pub async fn obsolete_dbids(
    store: Arc<dyn ObjectStore>,
    config: &AdminConfig,
    purge: bool,
) -> anyhow::Result<Value> {
    let gc = collector(store, config)?;
    let obsolete = gc.find_obsolete_dbids().await?;
    let deleted = if purge {
        let ids: Vec<String> = obsolete.iter().map(|identity| identity.dbid.clone()).collect();
        let deleted = gc.delete_dbids(&ids).await?;
        info!(bucket = %gc.bucket(), deleted, "Purged obsolete dbids");
        deleted
    } else {
        0
    };
    Ok(json!({ "obsolete": obsolete, "deleted": deleted }))
}

/// Copy the live files of a clone that still live only in its source
pub async fn savepoint(
    store: Arc<dyn ObjectStore>,
    config: &AdminConfig,
    src_path: &str,
    dest_bucket: &str,
    dest_path: &str,
) -> anyhow::Result<Value> {
    let retry = config.retry();
    let src = RemoteLocation::new(config.bucket()?, src_path);
    let dest = RemoteLocation::new(config.resolve_bucket(dest_bucket), dest_path);

    let backend = ManifestBackend::Remote {
        store: store.clone(),
        retry: retry.clone(),
        location: dest.clone(),
    };
    let claim = OwnershipManifest::new(backend, ADMIN_WRITER)
        .authoritative()
        .await?
        .ok_or_else(|| anyhow::anyhow!("no ownership pointer at {}", dest))?;

    let coordinator = CloneCoordinator::new(store, retry, Some(src), Some(dest));
    let report = coordinator.savepoint(&claim.generation).await?;
    Ok(serde_json::to_value(report)?)
}
