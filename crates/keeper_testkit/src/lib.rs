//! # Keeper Testkit
//!
//! Test utilities for the Keeper metadata repository.
//!
//! This crate provides:
//! - Repository fixtures over temporary directories
//! - Property-based test generators using proptest
//! - An in-memory directory tree to drive scans
//! - A tracing initialiser for test output
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keeper_testkit::prelude::*;
//!
//! #[test]
//! fn lookup() {
//!     let repo = TestRepository::memory();
//!     repo.put_file_version(&FileVersion::new("/a", 1, 1)).unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod tree;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::tree::*;
}

pub use fixtures::*;
pub use generators::*;
pub use tree::*;
