//! Disposable on-disk sorted maps.

use crate::backend::RawEntries;
use crate::error::{StorageError, StorageResult};
use crate::range::KeyRange;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tempfile::TempDir;
use tracing::debug;

const MIB: usize = 1024 * 1024;
const TEMP_TABLE: &str = "temp";

/// A sorted byte map in a private LMDB environment under a temporary
/// directory.
///
/// Used for maintenance work whose intermediate state may not fit in
/// memory. The map grows on demand and its files are deleted on drop.
#[derive(Debug)]
pub struct TempMap {
    env: Option<Env>,
    db: Database<Bytes, Bytes>,
    map_size: usize,
    growth_increment: usize,
    // Dropped after `env` is closed in `Drop`.
    _dir: TempDir,
}

impl TempMap {
    /// Creates an empty map with a 16 MiB initial size.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory or environment cannot be
    /// created.
    pub fn new() -> StorageResult<Self> {
        Self::with_map_size(16 * MIB)
    }

    /// Creates an empty map with the given initial size, which is also the
    /// growth increment.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory or environment cannot be
    /// created.
    #[allow(unsafe_code)]
    pub fn with_map_size(map_size: usize) -> StorageResult<Self> {
        let dir = tempfile::Builder::new().prefix("keeper-temp").tempdir()?;
        // SAFETY: the directory is freshly created and private to this map.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(dir.path())?
        };
        let mut txn = env.write_txn()?;
        let db = env.create_database::<Bytes, Bytes>(&mut txn, Some(TEMP_TABLE))?;
        txn.commit()?;

        Ok(Self {
            env: Some(env),
            db,
            map_size,
            growth_increment: map_size.max(MIB),
            _dir: dir,
        })
    }

    fn env(&self) -> StorageResult<&Env> {
        self.env.as_ref().ok_or(StorageError::Closed)
    }

    /// Inserts every entry in one transaction, replacing existing keys.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn insert_all(&mut self, entries: &[(Vec<u8>, Vec<u8>)]) -> StorageResult<()> {
        loop {
            let result = {
                let env = self.env()?;
                let mut txn = env.write_txn()?;
                let mut result = Ok(());
                for (key, value) in entries {
                    if let Err(err) = self.db.put(&mut txn, key, value) {
                        result = Err(StorageError::from(err));
                        break;
                    }
                }
                match result {
                    Ok(()) => txn.commit().map_err(StorageError::from),
                    Err(err) => Err(err),
                }
            };
            match result {
                Err(err) if err.is_map_full() => self.grow()?,
                other => return other,
            }
        }
    }

    /// Inserts a single entry.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.insert_all(&[(key.to_vec(), value.to_vec())])
    }

    /// Reads the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let txn = self.env()?.read_txn()?;
        Ok(self.db.get(&txn, key)?.map(<[u8]>::to_vec))
    }

    /// Returns up to `limit` entries of `range` in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn scan(&self, range: &KeyRange, limit: usize) -> StorageResult<RawEntries> {
        if limit == 0 || range.is_empty() {
            return Ok(Vec::new());
        }
        let txn = self.env()?.read_txn()?;
        let bounds = range.as_slices();
        let mut entries = Vec::new();
        for item in self.db.range(&txn, &bounds)? {
            let (key, value) = item?;
            entries.push((key.to_vec(), value.to_vec()));
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn len(&self) -> StorageResult<u64> {
        let txn = self.env()?.read_txn()?;
        Ok(self.db.len(&txn)?)
    }

    /// Returns true if the map holds no entries.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    #[allow(unsafe_code)]
    fn grow(&mut self) -> StorageResult<()> {
        let new_size = self.map_size + self.growth_increment;
        // SAFETY: every transaction of this private environment is scoped to
        // a single method call and none is alive here.
        unsafe { self.env()?.resize(new_size)? };
        self.map_size = new_size;
        debug!(map_size = new_size, "grew temporary map");
        Ok(())
    }
}

impl Drop for TempMap {
    fn drop(&mut self) {
        if let Some(env) = self.env.take() {
            env.prepare_for_closing().wait();
        }
    }
}
