//! Repository directory management.
//!
//! This module handles the file system layout of a repository:
//!
//! ```text
//! <repo_path>/
//! ├─ LOCK              # Advisory lock held by the process using the store
//! ├─ LOCK.request      # Advisory lock held by a process waiting for LOCK
//! ├─ VERSION           # Storage backend revision, e.g. "lmdb-1"
//! └─ store/            # Embedded store files
//! ```

use crate::error::{CoreError, CoreResult};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = "LOCK";
const REQUEST_FILE: &str = "LOCK.request";
const VERSION_FILE: &str = "VERSION";
const VERSION_TEMP: &str = "VERSION.tmp";
const STORE_DIR: &str = "store";

/// Paths of one repository directory.
#[derive(Debug, Clone)]
pub struct RepositoryDir {
    path: PathBuf,
}

impl RepositoryDir {
    /// Opens or creates a repository directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - The path exists but is not a directory
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "repository directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Returns the repository directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the main lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.path.join(LOCK_FILE)
    }

    /// Returns the path of the request lock file.
    #[must_use]
    pub fn request_path(&self) -> PathBuf {
        self.path.join(REQUEST_FILE)
    }

    /// Returns the path of the version marker.
    #[must_use]
    pub fn version_path(&self) -> PathBuf {
        self.path.join(VERSION_FILE)
    }

    /// Returns the directory holding the embedded store.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.path.join(STORE_DIR)
    }

    /// Reads the backend revision from the version marker.
    ///
    /// Returns `None` if the marker doesn't exist (new repository).
    pub fn read_version(&self) -> CoreResult<Option<String>> {
        let version_path = self.version_path();
        if !version_path.exists() {
            return Ok(None);
        }
        let revision = fs::read_to_string(&version_path)?;
        let revision = revision.trim();
        if revision.is_empty() {
            return Ok(None);
        }
        Ok(Some(revision.to_owned()))
    }

    /// Writes the version marker atomically (write, sync, rename).
    pub fn write_version(&self, revision: &str) -> CoreResult<()> {
        let temp_path = self.path.join(VERSION_TEMP);
        let mut file = File::create(&temp_path)?;
        writeln!(file, "{revision}")?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.version_path())?;
        self.sync_directory()?;
        Ok(())
    }

    /// Checks that the repository uses `revision`, writing the marker for a
    /// new writable repository.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if the marker names another
    /// revision: the repository must be upgraded before use.
    pub fn check_version(&self, revision: &str, read_only: bool) -> CoreResult<()> {
        match self.read_version()? {
            Some(found) if found == revision => Ok(()),
            Some(found) => {
                warn!(
                    path = %self.path.display(),
                    found = %found,
                    expected = revision,
                    "repository backend revision mismatch"
                );
                Err(CoreError::invalid_format(format!(
                    "repository uses backend revision {found}, expected {revision}; upgrade required"
                )))
            }
            None if read_only => Ok(()),
            None => {
                debug!(path = %self.path.display(), revision, "writing repository version marker");
                self.write_version(revision)
            }
        }
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("repo");
        let dir = RepositoryDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.store_path(), path.join("store"));
    }

    #[test]
    fn open_missing_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = RepositoryDir::open(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn version_marker_is_written_once_and_checked() {
        let temp = tempdir().unwrap();
        let dir = RepositoryDir::open(temp.path(), true).unwrap();

        dir.check_version("lmdb-1", true).unwrap();
        assert_eq!(dir.read_version().unwrap(), None);

        dir.check_version("lmdb-1", false).unwrap();
        assert_eq!(dir.read_version().unwrap().as_deref(), Some("lmdb-1"));
        dir.check_version("lmdb-1", false).unwrap();

        assert!(matches!(
            dir.check_version("lmdb-2", false),
            Err(CoreError::InvalidFormat { .. })
        ));
    }
}
