//! Named tables of the repository store.

use std::fmt;

/// A named table (LMDB sub-database) inside the repository store.
///
/// Tables are addressed logically. The block table has two physical
/// homes so that compaction can fill a shadow copy and swap it in; engines
/// resolve [`Table::Blocks`] and [`Table::BlocksAlternate`] to whichever
/// physical table is currently live or shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// File versions keyed by (path, added timestamp).
    FileVersions,
    /// Live content blocks keyed by content hash.
    Blocks,
    /// Shadow content-block table used while compacting.
    BlocksAlternate,
    /// Part hash to block hash mappings.
    FileParts,
    /// Directory snapshots keyed by (path, added timestamp).
    Directories,
    /// Persisted scan state keyed by (set id, path).
    ActivePaths,
    /// Pending updates keyed by hashed path.
    PendingUpdates,
    /// Pending update queue keyed by (due timestamp, hashed path).
    PendingUpdateQueue,
    /// Next-run markers keyed by set id.
    PendingSets,
    /// Share-specific block metadata keyed by (public key, block hash).
    AdditionalBlocks,
    /// In-flight uploads keyed by path.
    PartialFiles,
}

impl Table {
    /// Every logical table, in a stable order.
    pub const ALL: [Table; 11] = [
        Table::FileVersions,
        Table::Blocks,
        Table::BlocksAlternate,
        Table::FileParts,
        Table::Directories,
        Table::ActivePaths,
        Table::PendingUpdates,
        Table::PendingUpdateQueue,
        Table::PendingSets,
        Table::AdditionalBlocks,
        Table::PartialFiles,
    ];

    /// Returns the table name used for diagnostics and row counts.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Table::FileVersions => "files",
            Table::Blocks => "blocks",
            Table::BlocksAlternate => "blocks_alternate",
            Table::FileParts => "file_parts",
            Table::Directories => "directories",
            Table::ActivePaths => "active_paths",
            Table::PendingUpdates => "pending_updates",
            Table::PendingUpdateQueue => "pending_update_queue",
            Table::PendingSets => "pending_sets",
            Table::AdditionalBlocks => "additional_blocks",
            Table::PartialFiles => "partial_files",
        }
    }

    /// Resolves the logical table to its physical sub-database name.
    ///
    /// `blocks_swapped` is the engine's persisted swap flag: when set, the
    /// live block table is `blocks.1` and the shadow is `blocks.0`.
    #[must_use]
    pub const fn physical(self, blocks_swapped: bool) -> &'static str {
        match (self, blocks_swapped) {
            (Table::Blocks, false) | (Table::BlocksAlternate, true) => "blocks.0",
            (Table::Blocks, true) | (Table::BlocksAlternate, false) => "blocks.1",
            (other, _) => other.name(),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical sub-databases, including the engine's own metadata table.
pub(crate) const PHYSICAL_TABLES: [&str; 12] = [
    "files",
    "blocks.0",
    "blocks.1",
    "file_parts",
    "directories",
    "active_paths",
    "pending_updates",
    "pending_update_queue",
    "pending_sets",
    "additional_blocks",
    "partial_files",
    META_TABLE,
];

/// Engine-private table holding the block swap flag.
pub(crate) const META_TABLE: &str = "meta";

/// Key of the block swap flag inside [`META_TABLE`].
pub(crate) const BLOCKS_SWAPPED_KEY: &[u8] = b"blocks.swapped";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_tables_swap_physical_homes() {
        assert_eq!(Table::Blocks.physical(false), "blocks.0");
        assert_eq!(Table::BlocksAlternate.physical(false), "blocks.1");
        assert_eq!(Table::Blocks.physical(true), "blocks.1");
        assert_eq!(Table::BlocksAlternate.physical(true), "blocks.0");
        assert_eq!(Table::FileVersions.physical(true), "files");
    }

    #[test]
    fn every_logical_table_has_a_physical_home() {
        for table in Table::ALL {
            for swapped in [false, true] {
                assert!(PHYSICAL_TABLES.contains(&table.physical(swapped)));
            }
        }
    }
}
