//! Repository entities.
//!
//! Every entity is a serde record stored through [`crate::value`]. The key
//! of each record is derived from its fields by [`Record::key`], so a record
//! always carries everything needed to locate it, including the true path
//! of a long path whose key is hashed.

use crate::clock::Timestamp;
use crate::error::CoreResult;
use crate::key::{pair_key, path_hash, version_key, PathKey};
use keeper_storage::Table;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A record stored in one table.
pub trait Record: Serialize + DeserializeOwned {
    /// The table holding records of this type.
    const TABLE: Table;

    /// Returns the record's key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::InvalidKey`] if a key field cannot be
    /// encoded.
    fn key(&self) -> CoreResult<Vec<u8>>;
}

/// A record keyed by `(path, added timestamp)`.
pub trait Versioned: Record {
    /// The path the record describes.
    fn path(&self) -> &str;

    /// When the record was added.
    fn added(&self) -> Timestamp;
}

/// One observed state of a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Absolute path.
    pub path: String,
    /// When this version was recorded.
    pub added: Timestamp,
    /// File length in bytes.
    pub length: u64,
    /// Modification time reported by the filesystem.
    pub last_changed: Timestamp,
    /// Marks the path as deleted at `added`.
    pub deleted: bool,
    /// Unix permission bits, if known.
    pub permissions: Option<u32>,
    /// Hashes of the blocks holding the content, in file order.
    pub blocks: Vec<String>,
}

impl FileVersion {
    /// Creates a live version with no content blocks.
    #[must_use]
    pub fn new(path: impl Into<String>, added: Timestamp, length: u64) -> Self {
        Self {
            path: path.into(),
            added,
            length,
            last_changed: added,
            deleted: false,
            permissions: None,
            blocks: Vec::new(),
        }
    }

    /// Creates a deletion marker.
    #[must_use]
    pub fn deletion(path: impl Into<String>, added: Timestamp) -> Self {
        Self {
            deleted: true,
            ..Self::new(path, added, 0)
        }
    }
}

impl Record for FileVersion {
    const TABLE: Table = Table::FileVersions;

    fn key(&self) -> CoreResult<Vec<u8>> {
        Ok(version_key(&self.path, self.added))
    }
}

impl Versioned for FileVersion {
    fn path(&self) -> &str {
        &self.path
    }

    fn added(&self) -> Timestamp {
        self.added
    }
}

/// A slice of a block addressed by its own hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubBlock {
    /// Hash of the slice.
    pub hash: String,
    /// Byte offset inside the block.
    pub offset: u64,
}

/// One deduplicated content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Content hash.
    pub hash: String,
    /// Storage locations holding the block.
    pub locations: Vec<String>,
    /// Encoding format of the stored block.
    pub format: u32,
    /// When the block was created.
    pub created: Timestamp,
    /// Slices of the block, for blocks packing several small files.
    pub sub_blocks: Vec<SubBlock>,
}

impl Block {
    /// Creates a block stored at one location.
    #[must_use]
    pub fn new(hash: impl Into<String>, location: impl Into<String>, created: Timestamp) -> Self {
        Self {
            hash: hash.into(),
            locations: vec![location.into()],
            format: 1,
            created,
            sub_blocks: Vec::new(),
        }
    }
}

impl Record for Block {
    const TABLE: Table = Table::Blocks;

    fn key(&self) -> CoreResult<Vec<u8>> {
        Ok(self.hash.as_bytes().to_vec())
    }
}

/// Mapping from a part hash to one of its blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePart {
    /// Hash of the file part.
    pub part_hash: String,
    /// Hash of the block.
    pub block_hash: String,
    /// Index of the block within the file.
    pub index: u32,
}

impl Record for FilePart {
    const TABLE: Table = Table::FileParts;

    fn key(&self) -> CoreResult<Vec<u8>> {
        pair_key(&self.part_hash, self.block_hash.as_bytes())
    }
}

/// Children of a directory at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// Absolute path.
    pub path: String,
    /// When this snapshot was recorded.
    pub added: Timestamp,
    /// Names of the children.
    pub children: BTreeSet<String>,
    /// Unix permission bits, if known.
    pub permissions: Option<u32>,
    /// Marks the directory as deleted at `added`.
    pub deleted: bool,
}

impl DirectorySnapshot {
    /// Creates a snapshot of a live directory.
    #[must_use]
    pub fn new<I, S>(path: impl Into<String>, added: Timestamp, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            added,
            children: children.into_iter().map(Into::into).collect(),
            permissions: None,
            deleted: false,
        }
    }
}

impl Record for DirectorySnapshot {
    const TABLE: Table = Table::Directories;

    fn key(&self) -> CoreResult<Vec<u8>> {
        Ok(version_key(&self.path, self.added))
    }
}

impl Versioned for DirectorySnapshot {
    fn path(&self) -> &str {
        &self.path
    }

    fn added(&self) -> Timestamp {
        self.added
    }
}

/// Resolution of one child during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildStatus {
    /// Backed up, or unchanged and already backed up.
    Included,
    /// Filtered out or failed terminally.
    Excluded,
    /// Not fully processed; retried by a later scan.
    Incomplete,
}

/// One child slot of an [`ActivePath`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveChild {
    /// Entry name within the directory.
    pub name: String,
    /// Whether the child is a directory.
    pub directory: bool,
    /// Resolution, or `None` while unresolved.
    pub status: Option<ChildStatus>,
}

/// Persisted state of one directory being scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePath {
    /// Backup set running the scan.
    pub set_id: String,
    /// Absolute path of the directory.
    pub path: String,
    /// One slot per child, in listing order.
    pub children: Vec<ActiveChild>,
    /// Loaded from a previous run and not yet revisited by this one.
    pub unprocessed: bool,
}

impl ActivePath {
    /// Creates an entry with every child unresolved.
    #[must_use]
    pub fn new(set_id: impl Into<String>, path: impl Into<String>, children: Vec<(String, bool)>) -> Self {
        Self {
            set_id: set_id.into(),
            path: path.into(),
            children: children
                .into_iter()
                .map(|(name, directory)| ActiveChild {
                    name,
                    directory,
                    status: None,
                })
                .collect(),
            unprocessed: false,
        }
    }

    /// Returns true once every child is resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.children.iter().all(|child| child.status.is_some())
    }

    /// Sets the status of the child called `name`; returns false if there is
    /// no such child.
    pub fn resolve(&mut self, name: &str, status: ChildStatus) -> bool {
        match self.children.iter_mut().find(|child| child.name == name) {
            Some(child) => {
                child.status = Some(status);
                true
            }
            None => false,
        }
    }

    /// Returns the status the directory resolves to in its parent.
    ///
    /// `Included` if any child is included, else `Incomplete` if any child
    /// is incomplete or unresolved, else `Excluded`.
    #[must_use]
    pub fn status(&self) -> ChildStatus {
        let statuses = || self.children.iter().map(|child| child.status);
        if statuses().any(|s| s == Some(ChildStatus::Included)) {
            ChildStatus::Included
        } else if statuses().any(|s| s != Some(ChildStatus::Excluded)) {
            ChildStatus::Incomplete
        } else {
            ChildStatus::Excluded
        }
    }

    /// Names recorded in the directory snapshot emitted on completion.
    pub fn snapshot_children(&self) -> impl Iterator<Item = &str> {
        self.children
            .iter()
            .filter(|child| {
                matches!(
                    child.status,
                    Some(ChildStatus::Included | ChildStatus::Incomplete)
                )
            })
            .map(|child| child.name.as_str())
    }
}

impl Record for ActivePath {
    const TABLE: Table = Table::ActivePaths;

    fn key(&self) -> CoreResult<Vec<u8>> {
        pair_key(&self.set_id, &PathKey::for_path(&self.path).to_bytes())
    }
}

/// A path queued for re-examination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    /// Absolute path.
    pub path: String,
    /// When the path should be rechecked.
    pub due: Timestamp,
    /// When the latest notification arrived.
    pub last_updated: Timestamp,
}

impl Record for PendingUpdate {
    const TABLE: Table = Table::PendingUpdates;

    fn key(&self) -> CoreResult<Vec<u8>> {
        Ok(path_hash(&self.path).to_vec())
    }
}

/// Next-run marker for a backup set or maintenance task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSetSchedule {
    /// Backup set or task id.
    pub set_id: String,
    /// When the next run is scheduled.
    pub scheduled_at: Timestamp,
    /// Cron expression the schedule was derived from.
    pub schedule: String,
}

impl Record for PendingSetSchedule {
    const TABLE: Table = Table::PendingSets;

    fn key(&self) -> CoreResult<Vec<u8>> {
        Ok(self.set_id.as_bytes().to_vec())
    }
}

/// Share-specific re-keyed metadata for a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalBlock {
    /// Public key of the share.
    pub public_key: String,
    /// Hash of the block.
    pub block_hash: String,
    /// Whether the share still references the block.
    pub used: bool,
    /// Block properties re-encrypted for the share, opaque here.
    pub properties: Vec<u8>,
}

impl Record for AdditionalBlock {
    const TABLE: Table = Table::AdditionalBlocks;

    fn key(&self) -> CoreResult<Vec<u8>> {
        pair_key(&self.public_key, self.block_hash.as_bytes())
    }
}

/// In-flight upload state of a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFile {
    /// Absolute path.
    pub path: String,
    /// When the upload started.
    pub started: Timestamp,
    /// Bytes uploaded so far.
    pub uploaded: u64,
    /// Provider upload session id.
    pub upload_id: String,
    /// Blocks uploaded so far.
    pub blocks: Vec<String>,
}

impl Record for PartialFile {
    const TABLE: Table = Table::PartialFiles;

    fn key(&self) -> CoreResult<Vec<u8>> {
        Ok(PathKey::for_path(&self.path).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(statuses: &[Option<ChildStatus>]) -> ActivePath {
        let mut entry = ActivePath::new(
            "set",
            "/d",
            (0..statuses.len()).map(|i| (format!("c{i}"), false)).collect(),
        );
        for (child, status) in entry.children.iter_mut().zip(statuses) {
            child.status = *status;
        }
        entry
    }

    #[test]
    fn directory_status_aggregates_children() {
        use ChildStatus::*;
        assert_eq!(active(&[Some(Excluded), Some(Included)]).status(), Included);
        assert_eq!(active(&[Some(Excluded), Some(Incomplete)]).status(), Incomplete);
        assert_eq!(active(&[Some(Excluded), Some(Excluded)]).status(), Excluded);
        assert_eq!(active(&[]).status(), Excluded);
        assert!(active(&[]).is_complete());
        assert!(!active(&[Some(Included), None]).is_complete());
    }

    #[test]
    fn snapshot_children_skip_excluded() {
        use ChildStatus::*;
        let entry = active(&[Some(Included), Some(Excluded), Some(Incomplete)]);
        let names: Vec<_> = entry.snapshot_children().collect();
        assert_eq!(names, vec!["c0", "c2"]);
    }

    #[test]
    fn keys_follow_fields() {
        let version = FileVersion::new("/a/b.txt", 100, 10);
        assert_eq!(version.key().unwrap(), version_key("/a/b.txt", 100));

        let part = FilePart {
            part_hash: "p".into(),
            block_hash: "b".into(),
            index: 0,
        };
        assert_eq!(part.key().unwrap(), b"p\0b".to_vec());

        let schedule = PendingSetSchedule {
            set_id: "bad\0id".into(),
            scheduled_at: 0,
            schedule: "* * * * *".into(),
        };
        assert!(schedule.key().is_ok());

        let share = AdditionalBlock {
            public_key: "bad\0key".into(),
            block_hash: "b".into(),
            used: true,
            properties: Vec::new(),
        };
        assert!(share.key().is_err());
    }
}
