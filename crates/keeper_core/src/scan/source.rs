//! The filesystem side of a scan.

use crate::error::CoreResult;
use crate::model::ChildStatus;
use std::io;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Name within the directory.
    pub name: String,
    /// Whether the entry is a directory.
    pub directory: bool,
}

impl SourceEntry {
    /// A regular file.
    #[must_use]
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: false,
        }
    }

    /// A directory.
    #[must_use]
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: true,
        }
    }
}

/// Lists directories and backs up files for an [`super::ActiveScan`].
pub trait ScanSource {
    /// Lists the children of the directory at `path`.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::NotFound`] marks a directory that vanished; the scan
    /// excludes it. Any other error stops the scan.
    fn list(&self, path: &str) -> io::Result<Vec<SourceEntry>>;

    /// Backs up the file at `path` if it changed.
    ///
    /// Returns [`ChildStatus::Included`] when the file is (or already was)
    /// backed up, [`ChildStatus::Excluded`] when it was skipped or failed
    /// for good.
    fn process_file(&self, path: &str) -> CoreResult<ChildStatus>;
}

impl<S: ScanSource + ?Sized> ScanSource for &S {
    fn list(&self, path: &str) -> io::Result<Vec<SourceEntry>> {
        (**self).list(path)
    }

    fn process_file(&self, path: &str) -> CoreResult<ChildStatus> {
        (**self).process_file(path)
    }
}

/// Joins a directory path and a child name with `/`.
#[must_use]
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
