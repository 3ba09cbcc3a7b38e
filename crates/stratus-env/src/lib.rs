//! # Stratus Env
//!
//! Cloud storage environment for embedded LSM engines.
//!
//! This crate provides:
//! - **CloudEnv**: the file, directory and lock operations an engine expects,
//!   with table files kept in an object store and log segments optionally
//!   carried by a log stream
//! - **Ownership**: epoch-numbered claims over a database location, so that
//!   the last instance to open it wins
//! - **Cloning**: databases seeded from another location and local forks
//!   that never write back to their source
//! - **Garbage collection**: discovery of unreachable table files and stale
//!   database identities
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     CloudEnv                        │
//! │        (routes each path by its file role)          │
//! ├──────────────┬──────────────┬───────────────────────┤
//! │ Remote table │  Log tailer  │   Local filesystem    │
//! │    files     │  + segments  │                       │
//! ├──────────────┴──────┬───────┴───────────────────────┤
//! │ Ownership manifest  │ Clone coordinator │ Deletion  │
//! │  + generations      │  + dbid registry  │  ledger   │
//! ├─────────────────────┴───────────────────┴───────────┤
//! │          Retry executor over stratus-store          │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Naming
//!
//! A table file `000012.sst` written by the instance holding epoch id `e` is
//! stored as `<object_path>/000012.sst-e`. The `OWNERSHIP` pointer names the
//! generation file that maps logical names to these physical names.

pub mod classifier;
pub mod clone;
pub mod deletion;
pub mod env;
pub mod error;
pub mod file;
pub mod gc;
pub mod log_record;
pub mod options;
pub mod ownership;
pub mod registry;
pub mod remote_file;
pub mod retry;
pub mod tailer;

pub use classifier::{classify, FileRole};
pub use clone::{CloneCoordinator, OpenKind, SavepointReport};
pub use env::CloudEnv;
pub use error::{EnvError, Result};
pub use file::{Directory, FileLock, FileOptions, ReadableFile, WritableFile};
pub use gc::GarbageCollector;
pub use options::{BucketOptions, CloudEnvOptions, RemoteLocation};
pub use ownership::{Generation, OwnershipManifest, OwnershipPointer, OwnershipState};
pub use registry::{DbIdentity, DbidRegistry};
pub use retry::RetryExecutor;
pub use tailer::LogTailer;
