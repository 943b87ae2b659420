//! # Keeper Storage
//!
//! Embedded ordered key-value engines for the Keeper metadata repository.
//!
//! This crate is the lowest layer of the repository. Engines are **opaque
//! byte stores** with named tables: they do not interpret the records they
//! hold, and they own their transactions.
//!
//! ## Design Principles
//!
//! - Keys order as unsigned bytes
//! - Every table lives in one environment with one shared transaction
//! - A full store grows instead of failing
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Engines
//!
//! - [`LmdbEngine`] - Persistent engine backed by LMDB
//! - [`InMemoryEngine`] - For testing and ephemeral repositories
//!
//! [`TempMap`] is a throwaway sorted map for maintenance jobs.
//!
//! ## Example
//!
//! ```rust
//! use keeper_storage::{InMemoryEngine, KeyRange, Direction, StorageEngine, Table};
//!
//! let engine = InMemoryEngine::new();
//! engine.put(Table::FileVersions, b"/etc/hosts", b"v1").unwrap();
//! let page = engine
//!     .scan(Table::FileVersions, &KeyRange::all(), Direction::Ascending, 10)
//!     .unwrap();
//! assert_eq!(page.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod error;
mod lmdb;
mod memory;
mod range;
mod stats;
mod table;
mod temp;

pub use backend::{EngineFactory, RawEntries, StorageEngine, WriteBatch, WriteOp};
pub use config::EngineConfig;
pub use error::{StorageError, StorageResult};
pub use lmdb::{LmdbEngine, LmdbFactory, LMDB_REVISION};
pub use memory::{InMemoryEngine, InMemoryFactory, MEMORY_REVISION};
pub use range::{Direction, KeyRange};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use table::Table;
pub use temp::TempMap;
