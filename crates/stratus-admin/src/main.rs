//! Stratus Admin - inspect and maintain database buckets

mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::AdminConfig;
use std::path::PathBuf;
use std::sync::Arc;
use stratus_store::{FsObjectStore, ObjectStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stratus-admin")]
#[command(about = "Inspect and maintain Stratus database buckets")]
#[command(version)]
struct Args {
    /// Root directory of the filesystem object store
    #[arg(long, env = "STRATUS_STORE_ROOT")]
    store_root: Option<PathBuf>,

    /// Bucket to operate on, without the prefix
    #[arg(short, long, env = "STRATUS_BUCKET")]
    bucket: Option<String>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "STRATUS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "STRATUS_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered databases
    Dbids,
    /// Show the ownership pointer of a database path
    Pointer {
        /// Object path of the database
        #[arg(long)]
        path: String,
    },
    /// Report table and generation files no database references
    ObsoleteFiles {
        /// Delete the reported files
        #[arg(long)]
        purge: bool,
    },
    /// Report registered databases that no longer have a pointer
    ObsoleteDbids {
        /// Remove the reported registry entries
        #[arg(long)]
        purge: bool,
    },
    /// Copy a clone's live files out of its source
    Savepoint {
        /// Object path of the source database in --bucket
        #[arg(long)]
        src_path: String,
        /// Bucket of the clone, without the prefix
        #[arg(long)]
        dest_bucket: String,
        /// Object path of the clone
        #[arg(long)]
        dest_path: String,
    },
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stratus_admin=info,stratus_env=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(args.log_json);

    let mut config = AdminConfig::load(args.config.as_deref())?;
    if args.store_root.is_some() {
        config.store_root = args.store_root;
    }
    if args.bucket.is_some() {
        config.bucket = args.bucket;
    }

    let root = config
        .store_root
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no store root configured; pass --store-root"))?;
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::open(&root).await?);
    tracing::debug!(root = %root.display(), "Opened object store");

    let output = match args.command {
        Command::Dbids => commands::dbids(store, &config).await?,
        Command::Pointer { path } => commands::pointer(store, &config, &path).await?,
        Command::ObsoleteFiles { purge } => commands::obsolete_files(store, &config, purge).await?,
        Command::ObsoleteDbids { purge } => commands::obsolete_dbids(store, &config, purge).await?,
        Command::Savepoint {
            src_path,
            dest_bucket,
            dest_path,
        } => commands::savepoint(store, &config, &src_path, &dest_bucket, &dest_path).await?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
