//! # Keeper Core
//!
//! The metadata repository of the Keeper backup agent.
//!
//! This crate provides:
//! - Sortable key encodings for every entity ([`key`])
//! - Compressed CBOR values ([`value`])
//! - Cross-process and in-process locking ([`lock`])
//! - The [`Repository`] facade: typed entity operations over one store
//! - Resumable directory scans ([`ActiveScan`])
//! - The debounced pending update queue
//! - Log replay, queue repair and block compaction
//!
//! ## Example
//!
//! ```rust,no_run
//! use keeper_core::{Direction, FileVersion, Repository, RepositoryConfig};
//!
//! let repo = Repository::open("/var/lib/keeper/meta", RepositoryConfig::default())?;
//! repo.put_file_version(&FileVersion::new("/a/b.txt", 100, 10))?;
//! repo.put_file_version(&FileVersion::new("/a/b.txt", 200, 20))?;
//!
//! let then = repo.file_version("/a/b.txt", Some(150))?;
//! assert_eq!(then.map(|v| v.length), Some(10));
//! let listed = repo.files_with_prefix("/a/", Direction::Ascending)?;
//! assert_eq!(listed.len(), 1);
//! # Ok::<(), keeper_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod dir;
mod error;
pub mod key;
pub mod lock;
mod maintenance;
mod model;
mod pending;
mod registry;
mod replay;
mod repository;
mod scan;
mod store;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::RepositoryConfig;
pub use dir::RepositoryDir;
pub use error::{CoreError, CoreResult};
pub use maintenance::{BlockRewrite, QueueRepair};
pub use model::{
    ActiveChild, ActivePath, AdditionalBlock, Block, ChildStatus, DirectorySnapshot, FilePart,
    FileVersion, PartialFile, PendingSetSchedule, PendingUpdate, Record, SubBlock, Versioned,
};
pub use pending::UpdateDisposition;
pub use registry::RepositoryRegistry;
pub use replay::ReplayKind;
pub use repository::{AccessGuard, EntityScan, LockKind, Repository};
pub use scan::{
    join_path, ActiveScan, BackupSet, IncludeRules, ScanOutcome, ScanSource, ScanStats, SourceEntry,
};

pub use keeper_storage::{Direction, EngineConfig, KeyRange, Table};
