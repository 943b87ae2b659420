//! Entry point for rebuilding a repository from the append-only log.
//!
//! Each log entry carries a [`ReplayKind`] tag and a payload in the same
//! encoding as stored values. Replayed writes go through the same entity
//! operations as live writes.

use crate::error::{CoreError, CoreResult};
use crate::model::{
    AdditionalBlock, Block, DirectorySnapshot, FilePart, FileVersion, PartialFile, PendingSetSchedule,
    PendingUpdate,
};
use crate::repository::Repository;
use crate::value;
use tracing::trace;

/// Type of one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplayKind {
    /// A [`FileVersion`].
    FileVersion = 1,
    /// A [`Block`].
    Block = 2,
    /// A [`FilePart`].
    FilePart = 3,
    /// A [`DirectorySnapshot`].
    Directory = 4,
    /// A [`PendingSetSchedule`].
    PendingSet = 5,
    /// An [`AdditionalBlock`].
    AdditionalBlock = 6,
    /// A [`PartialFile`].
    PartialFile = 7,
    /// A [`PendingUpdate`]; requeued as due immediately.
    PendingUpdate = 8,
    /// Deletion of the block whose hash is the payload.
    DeleteBlock = 9,
    /// Deletion of the set schedule whose id is the payload.
    DeletePendingSet = 10,
    /// Removal of the share whose public key is the payload.
    RemoveShare = 11,
}

impl ReplayKind {
    /// Returns the log tag of the kind.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ReplayKind {
    type Error = CoreError;

    fn try_from(tag: u8) -> CoreResult<Self> {
        Ok(match tag {
            1 => Self::FileVersion,
            2 => Self::Block,
            3 => Self::FilePart,
            4 => Self::Directory,
            5 => Self::PendingSet,
            6 => Self::AdditionalBlock,
            7 => Self::PartialFile,
            8 => Self::PendingUpdate,
            9 => Self::DeleteBlock,
            10 => Self::DeletePendingSet,
            11 => Self::RemoveShare,
            other => return Err(CoreError::invalid_format(format!("unknown log entry tag {other}"))),
        })
    }
}

impl Repository {
    /// Applies one log entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the payload does not decode as
    /// `kind`, or any error of the underlying entity operation.
    pub fn replay_entry(&self, kind: ReplayKind, payload: &[u8]) -> CoreResult<()> {
        trace!(?kind, len = payload.len(), "replaying log entry");
        match kind {
            ReplayKind::FileVersion => self.put_file_version(&value::decode::<FileVersion>(payload)?),
            ReplayKind::Block => self.put_block(&value::decode::<Block>(payload)?),
            ReplayKind::FilePart => self.put_file_part(&value::decode::<FilePart>(payload)?),
            ReplayKind::Directory => self.put_directory(&value::decode::<DirectorySnapshot>(payload)?),
            ReplayKind::PendingSet => self.put_pending_set(&value::decode::<PendingSetSchedule>(payload)?),
            ReplayKind::AdditionalBlock => {
                self.put_additional_block(&value::decode::<AdditionalBlock>(payload)?)
            }
            ReplayKind::PartialFile => self.put_partial_file(&value::decode::<PartialFile>(payload)?),
            ReplayKind::PendingUpdate => {
                let update = value::decode::<PendingUpdate>(payload)?;
                self.schedule_update(&update.path, -1).map(|_| ())
            }
            ReplayKind::DeleteBlock => self
                .delete_block(&value::decode::<String>(payload)?)
                .map(|_| ()),
            ReplayKind::DeletePendingSet => self
                .delete_pending_set(&value::decode::<String>(payload)?)
                .map(|_| ()),
            ReplayKind::RemoveShare => self
                .remove_share(&value::decode::<String>(payload)?)
                .map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RepositoryConfig;
    use keeper_storage::InMemoryFactory;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn tags_round_trip() {
        for tag in 1..=11u8 {
            assert_eq!(ReplayKind::try_from(tag).unwrap().tag(), tag);
        }
        assert!(ReplayKind::try_from(0).is_err());
    }

    #[test]
    fn replayed_entries_match_live_writes() {
        let temp = tempdir().unwrap();
        let repo = Repository::open_with(
            temp.path(),
            RepositoryConfig::default(),
            Arc::new(InMemoryFactory::new()),
            Arc::new(ManualClock::new(500)),
        )
        .unwrap();

        let version = FileVersion::new("/a", 100, 7);
        repo.replay_entry(ReplayKind::FileVersion, &value::encode(&version).unwrap())
            .unwrap();
        let block = Block::new("h", "loc", 1);
        repo.replay_entry(ReplayKind::Block, &value::encode(&block).unwrap())
            .unwrap();
        let update = PendingUpdate {
            path: "/a".into(),
            due: 9_999,
            last_updated: 1,
        };
        repo.replay_entry(ReplayKind::PendingUpdate, &value::encode(&update).unwrap())
            .unwrap();

        assert_eq!(repo.file_version("/a", None).unwrap(), Some(version));
        assert_eq!(repo.block("h").unwrap(), Some(block));
        assert_eq!(repo.pending_update("/a").unwrap().unwrap().due, 500);

        repo.replay_entry(ReplayKind::DeleteBlock, &value::encode(&"h").unwrap())
            .unwrap();
        assert!(!repo.has_block("h").unwrap());
        assert!(matches!(
            repo.replay_entry(ReplayKind::Block, &[0x00, 0xff]),
            Err(CoreError::Codec { .. })
        ));
    }
}
