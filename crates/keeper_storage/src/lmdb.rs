//! LMDB-backed storage engine.
//!
//! The engine owns one LMDB environment and a dedicated worker thread. The
//! worker is the only code that ever touches the environment: it holds the
//! single long-lived transaction shared by all operations, applies write
//! batches, decides when to commit and grows the map when it fills up.
//! Callers on any thread send a [`Command`] and block on its reply.
//!
//! ## Growth
//!
//! Every `growth_check_interval` mutations the worker estimates usage from
//! per-table page statistics. When the estimate, inflated by
//! `overhead_factor`, crosses the map size minus the safety margin, it
//! commits, resizes the map and reopens the table handles. If LMDB still
//! reports `MDB_MAP_FULL`, the worker aborts the transaction, grows, and
//! replays every uncommitted mutation before retrying, so a full map never
//! loses data and never reaches the caller.

use crate::backend::{EngineFactory, RawEntries, StorageEngine, WriteBatch, WriteOp};
use crate::config::EngineConfig;
use crate::error::{StorageError, StorageResult};
use crate::range::{Direction, KeyRange};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::table::{Table, BLOCKS_SWAPPED_KEY, META_TABLE, PHYSICAL_TABLES};
use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn, RwTxn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Backend revision written to the repository version marker.
pub const LMDB_REVISION: &str = "lmdb-1";

/// Bytes charged per entry on top of page usage when estimating growth.
const ENTRY_OVERHEAD: u64 = 16;

type RawDb = Database<Bytes, Bytes>;

type Reply<T> = SyncSender<StorageResult<T>>;

enum Command {
    Get {
        table: Table,
        key: Vec<u8>,
        reply: Reply<Option<Vec<u8>>>,
    },
    Write {
        batch: WriteBatch,
        reply: Reply<Vec<bool>>,
    },
    Scan {
        table: Table,
        range: KeyRange,
        direction: Direction,
        limit: usize,
        reply: Reply<RawEntries>,
    },
    Count {
        table: Table,
        reply: Reply<u64>,
    },
    Commit {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// A storage engine backed by an LMDB environment.
///
/// # Thread Safety
///
/// The handle is `Send + Sync`; every call is forwarded to the worker
/// thread, which serializes all access to the environment.
///
/// # Example
///
/// ```no_run
/// use keeper_storage::{EngineConfig, LmdbEngine, StorageEngine, Table};
/// use std::path::Path;
///
/// let engine = LmdbEngine::open(Path::new("repo/store"), EngineConfig::default(), false).unwrap();
/// engine.put(Table::Blocks, b"hash", b"value").unwrap();
/// engine.commit().unwrap();
/// ```
#[derive(Debug)]
pub struct LmdbEngine {
    path: PathBuf,
    read_only: bool,
    sender: RwLock<Option<SyncSender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<EngineStats>,
}

impl LmdbEngine {
    /// Opens or creates the environment in `path` and starts its worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the environment
    /// cannot be opened, or (read-only) the store does not exist yet.
    pub fn open(path: &Path, config: EngineConfig, read_only: bool) -> StorageResult<Self> {
        if !read_only {
            std::fs::create_dir_all(path)?;
        }

        let env = open_env(path, &config, read_only)?;
        let tables = Tables::open(&env, read_only)?;
        let map_size = env.info().map_size;
        let stats = Arc::new(EngineStats::new(map_size as u64));

        let (sender, commands) = mpsc::sync_channel(config.queue_capacity.max(1));
        let worker_stats = Arc::clone(&stats);
        let handle = thread::Builder::new()
            .name("keeper-store".into())
            .spawn(move || run_worker(env, tables, config, read_only, map_size, worker_stats, commands))?;

        debug!(path = %path.display(), map_size, read_only, "opened repository store");

        Ok(Self {
            path: path.to_path_buf(),
            read_only,
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            stats,
        })
    }

    /// Returns the environment directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> StorageResult<T> {
        let sender = self.sender.read().clone().ok_or(StorageError::Closed)?;
        let (reply, response) = mpsc::sync_channel(1);
        sender.send(build(reply)).map_err(|_| StorageError::Closed)?;
        response.recv().map_err(|_| StorageError::Closed)?
    }
}

impl StorageEngine for LmdbEngine {
    fn get(&self, table: Table, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let key = key.to_vec();
        self.call(|reply| Command::Get { table, key, reply })
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<Vec<bool>> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        self.call(|reply| Command::Write { batch, reply })
    }

    fn scan(
        &self,
        table: Table,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> StorageResult<RawEntries> {
        let range = range.clone();
        self.call(|reply| Command::Scan {
            table,
            range,
            direction,
            limit,
            reply,
        })
    }

    fn count(&self, table: Table) -> StorageResult<u64> {
        self.call(|reply| Command::Count { table, reply })
    }

    fn commit(&self) -> StorageResult<()> {
        self.call(|reply| Command::Commit { reply })
    }

    fn close(&self) -> StorageResult<()> {
        let Some(sender) = self.sender.write().take() else {
            return Ok(());
        };

        let (reply, response) = mpsc::sync_channel(1);
        let result = match sender.send(Command::Shutdown { reply }) {
            Ok(()) => response.recv().unwrap_or(Err(StorageError::Closed)),
            Err(_) => Err(StorageError::Closed),
        };
        drop(sender);

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(path = %self.path.display(), "repository store worker panicked");
            }
        }

        debug!(path = %self.path.display(), "closed repository store");
        result
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for LmdbEngine {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "failed to close repository store cleanly");
        }
    }
}

/// Opens [`LmdbEngine`]s with a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct LmdbFactory {
    config: EngineConfig,
}

impl LmdbFactory {
    /// Creates a factory using `config` for every engine it opens.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for LmdbFactory {
    fn open(&self, path: &Path, read_only: bool) -> StorageResult<Arc<dyn StorageEngine>> {
        Ok(Arc::new(LmdbEngine::open(path, self.config.clone(), read_only)?))
    }

    fn revision(&self) -> &'static str {
        LMDB_REVISION
    }
}

#[allow(unsafe_code)]
fn open_env(path: &Path, config: &EngineConfig, read_only: bool) -> StorageResult<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(config.map_size).max_dbs(config.max_tables);
    if read_only {
        // SAFETY: READ_ONLY only narrows what the environment may do.
        unsafe {
            options.flags(EnvFlags::READ_ONLY);
        }
    }
    // SAFETY: the repository's process lock admits a single writer process
    // per directory, and the repository opens at most one engine per
    // directory inside this process.
    let env = unsafe { options.open(path)? };
    Ok(env)
}

/// Handles of every physical table plus the block swap flag.
#[derive(Debug, Clone)]
struct Tables {
    dbs: HashMap<&'static str, RawDb>,
    blocks_swapped: bool,
}

impl Tables {
    fn open(env: &Env, read_only: bool) -> StorageResult<Self> {
        let mut dbs = HashMap::new();
        let blocks_swapped = if read_only {
            let txn = env.read_txn()?;
            for name in PHYSICAL_TABLES {
                if let Some(db) = env.open_database::<Bytes, Bytes>(&txn, Some(name))? {
                    dbs.insert(name, db);
                }
            }
            let swapped = read_swapped_flag(dbs.get(META_TABLE).copied(), &txn)?;
            // Handles opened inside a transaction only survive its commit.
            txn.commit()?;
            swapped
        } else {
            let mut txn = env.write_txn()?;
            for name in PHYSICAL_TABLES {
                let db = env.create_database::<Bytes, Bytes>(&mut txn, Some(name))?;
                dbs.insert(name, db);
            }
            let swapped = read_swapped_flag(dbs.get(META_TABLE).copied(), &txn)?;
            txn.commit()?;
            swapped
        };
        Ok(Self {
            dbs,
            blocks_swapped,
        })
    }

    fn db(&self, table: Table) -> Option<RawDb> {
        self.dbs.get(table.physical(self.blocks_swapped)).copied()
    }

    fn meta(&self) -> Option<RawDb> {
        self.dbs.get(META_TABLE).copied()
    }

    fn all(&self) -> Vec<RawDb> {
        self.dbs.values().copied().collect()
    }
}

fn read_swapped_flag(meta: Option<RawDb>, txn: &RoTxn<'_>) -> StorageResult<bool> {
    let Some(meta) = meta else {
        return Ok(false);
    };
    Ok(matches!(meta.get(txn, BLOCKS_SWAPPED_KEY)?, Some([1])))
}

enum Txn<'e> {
    Write(RwTxn<'e>),
    Read(RoTxn<'e>),
}

impl<'e> Txn<'e> {
    fn read(&self) -> &RoTxn<'e> {
        match self {
            Txn::Write(txn) => &**txn,
            Txn::Read(txn) => txn,
        }
    }
}

fn run_worker(
    env: Env,
    tables: Tables,
    config: EngineConfig,
    read_only: bool,
    map_size: usize,
    stats: Arc<EngineStats>,
    commands: Receiver<Command>,
) {
    let shutdown = {
        let mut worker = Worker {
            env: &env,
            config,
            read_only,
            tables,
            txn: None,
            txn_started: None,
            uncommitted: Vec::new(),
            writes_since_check: 0,
            map_size,
            stats,
        };
        worker.serve(&commands)
    };

    // Wait until LMDB has released the files before acknowledging shutdown,
    // so the caller can hand the directory to another process.
    env.prepare_for_closing().wait();

    if let Some((reply, result)) = shutdown {
        let _ = reply.send(result);
    }
}

struct Worker<'e> {
    env: &'e Env,
    config: EngineConfig,
    read_only: bool,
    tables: Tables,
    txn: Option<Txn<'e>>,
    txn_started: Option<Instant>,
    /// Mutations applied to the open transaction since the last commit.
    uncommitted: Vec<WriteOp>,
    writes_since_check: u64,
    map_size: usize,
    stats: Arc<EngineStats>,
}

impl<'e> Worker<'e> {
    fn serve(&mut self, commands: &Receiver<Command>) -> Option<(Reply<()>, StorageResult<()>)> {
        loop {
            let command = match self.commit_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        self.commit_logged();
                        continue;
                    }
                    match commands.recv_timeout(deadline - now) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => {
                            self.commit_logged();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            self.commit_logged();
                            return None;
                        }
                    }
                }
                None => match commands.recv() {
                    Ok(command) => command,
                    Err(_) => {
                        self.commit_logged();
                        return None;
                    }
                },
            };

            match command {
                Command::Get { table, key, reply } => {
                    let _ = reply.send(self.get(table, &key));
                }
                Command::Write { batch, reply } => {
                    let _ = reply.send(self.write(batch));
                }
                Command::Scan {
                    table,
                    range,
                    direction,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(self.scan(table, &range, direction, limit));
                }
                Command::Count { table, reply } => {
                    let _ = reply.send(self.count(table));
                }
                Command::Commit { reply } => {
                    let _ = reply.send(self.commit());
                }
                Command::Shutdown { reply } => {
                    let result = self.commit();
                    self.txn = None;
                    return Some((reply, result));
                }
            }
        }
    }

    fn commit_deadline(&self) -> Option<Instant> {
        if self.uncommitted.is_empty() {
            return None;
        }
        self.txn_started
            .map(|started| started + self.config.max_commit_interval)
    }

    fn commit_logged(&mut self) {
        if let Err(err) = self.commit() {
            error!(%err, "periodic commit of repository store failed");
        }
    }

    fn txn(&mut self) -> StorageResult<&mut Txn<'e>> {
        if self.txn.is_none() {
            let txn = if self.read_only {
                Txn::Read(self.env.read_txn()?)
            } else {
                Txn::Write(self.env.write_txn()?)
            };
            self.txn = Some(txn);
            self.txn_started = Some(Instant::now());
        }
        self.txn.as_mut().ok_or(StorageError::Closed)
    }

    fn write_txn(&mut self) -> StorageResult<&mut RwTxn<'e>> {
        match self.txn()? {
            Txn::Write(txn) => Ok(txn),
            Txn::Read(_) => Err(StorageError::ReadOnly),
        }
    }

    fn get(&mut self, table: Table, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let Some(db) = self.tables.db(table) else {
            return Ok(None);
        };
        let txn = self.txn()?.read();
        Ok(db.get(txn, key)?.map(<[u8]>::to_vec))
    }

    fn scan(
        &mut self,
        table: Table,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> StorageResult<RawEntries> {
        let Some(db) = self.tables.db(table) else {
            return Ok(Vec::new());
        };
        if limit == 0 || range.is_empty() {
            return Ok(Vec::new());
        }

        let bounds = range.as_slices();
        let txn = self.txn()?.read();
        let mut entries = Vec::new();
        match direction {
            Direction::Ascending => {
                for item in db.range(txn, &bounds)? {
                    let (key, value) = item?;
                    entries.push((key.to_vec(), value.to_vec()));
                    if entries.len() >= limit {
                        break;
                    }
                }
            }
            Direction::Descending => {
                for item in db.rev_range(txn, &bounds)? {
                    let (key, value) = item?;
                    entries.push((key.to_vec(), value.to_vec()));
                    if entries.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(entries)
    }

    fn count(&mut self, table: Table) -> StorageResult<u64> {
        let Some(db) = self.tables.db(table) else {
            return Ok(0);
        };
        let txn = self.txn()?.read();
        Ok(db.len(txn)?)
    }

    fn write(&mut self, batch: WriteBatch) -> StorageResult<Vec<bool>> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }

        let ops = batch.into_ops();
        loop {
            match self.apply(&ops) {
                Ok(results) => {
                    self.stats.record_batch(ops.len());
                    self.writes_since_check += ops.len() as u64;
                    self.uncommitted.extend(ops);
                    self.after_write()?;
                    return Ok(results);
                }
                Err(err) if err.is_map_full() => self.recover_from_map_full()?,
                Err(err) => {
                    // Drop whatever part of the batch was applied.
                    if let Err(replay_err) = self.replay_uncommitted() {
                        error!(%replay_err, "failed to restore transaction after write error");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn apply(&mut self, ops: &[WriteOp]) -> StorageResult<Vec<bool>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let applied = match op {
                WriteOp::Put { table, key, value } => {
                    let db = self.writable_db(*table)?;
                    db.put(self.write_txn()?, key, value)?;
                    true
                }
                WriteOp::Delete { table, key } => {
                    let db = self.writable_db(*table)?;
                    db.delete(self.write_txn()?, key)?
                }
                WriteOp::Clear { table } => {
                    let db = self.writable_db(*table)?;
                    db.clear(self.write_txn()?)?;
                    true
                }
                WriteOp::SwapBlocks => {
                    self.swap_blocks()?;
                    true
                }
            };
            results.push(applied);
        }
        Ok(results)
    }

    fn writable_db(&self, table: Table) -> StorageResult<RawDb> {
        self.tables
            .db(table)
            .ok_or(StorageError::MissingTable(table.name()))
    }

    fn swap_blocks(&mut self) -> StorageResult<()> {
        let old_live = self.writable_db(Table::Blocks)?;
        let meta = self
            .tables
            .meta()
            .ok_or(StorageError::MissingTable(META_TABLE))?;
        let swapped = !self.tables.blocks_swapped;

        let txn = self.write_txn()?;
        meta.put(txn, BLOCKS_SWAPPED_KEY, &[u8::from(swapped)])?;
        old_live.clear(txn)?;
        self.tables.blocks_swapped = swapped;
        debug!(swapped, "swapped block tables");
        Ok(())
    }

    fn after_write(&mut self) -> StorageResult<()> {
        if self.writes_since_check >= self.config.growth_check_interval {
            self.writes_since_check = 0;
            self.grow_if_needed()?;
        }
        if self.uncommitted.len() >= self.config.max_uncommitted_writes
            || self
                .txn_started
                .is_some_and(|started| started.elapsed() >= self.config.max_commit_interval)
        {
            self.commit()?;
        }
        Ok(())
    }

    fn estimate_usage(&mut self) -> StorageResult<u64> {
        let dbs = self.tables.all();
        let txn = self.txn()?.read();
        let mut total = 0u64;
        for db in dbs {
            let stat = db.stat(txn)?;
            let pages = (stat.branch_pages + stat.leaf_pages + stat.overflow_pages) as u64;
            total += pages * u64::from(stat.page_size) + stat.entries as u64 * ENTRY_OVERHEAD;
        }
        Ok(total)
    }

    fn grow_if_needed(&mut self) -> StorageResult<()> {
        let used = self.estimate_usage()?;
        let inflated = (used as f64 * self.config.overhead_factor) as usize;
        if inflated < self.config.capacity(self.map_size) {
            return Ok(());
        }

        let mut new_size = self.map_size;
        while inflated >= self.config.capacity(new_size) {
            new_size += self.config.growth_increment.max(1);
        }

        debug!(used, inflated, map_size = self.map_size, "repository store approaching capacity");
        self.commit()?;
        self.grow_to(new_size)
    }

    #[allow(unsafe_code)]
    fn grow_to(&mut self, new_size: usize) -> StorageResult<()> {
        self.txn = None;
        self.txn_started = None;
        // SAFETY: the worker owns every transaction of this environment and
        // has just ended the only one, so no transaction is alive in this
        // process while the map is resized.
        unsafe { self.env.resize(new_size)? };
        self.map_size = new_size;
        self.tables = Tables::open(self.env, self.read_only)?;
        self.stats.record_growth(new_size as u64);
        info!(map_size = new_size, "grew repository store");
        Ok(())
    }

    fn recover_from_map_full(&mut self) -> StorageResult<()> {
        info!(
            map_size = self.map_size,
            pending = self.uncommitted.len(),
            "repository store full; growing and replaying open transaction"
        );
        let new_size = self.map_size + self.config.growth_increment.max(1);
        self.grow_to(new_size)?;
        self.replay_uncommitted()
    }

    /// Restarts the open transaction from the last commit and re-applies
    /// every uncommitted mutation.
    fn replay_uncommitted(&mut self) -> StorageResult<()> {
        self.txn = None;
        let meta = self.tables.meta();
        let committed_flag = read_swapped_flag(meta, self.txn()?.read())?;
        self.tables.blocks_swapped = committed_flag;

        let pending = std::mem::take(&mut self.uncommitted);
        let result = self.apply(&pending);
        self.uncommitted = pending;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_map_full() => self.recover_from_map_full(),
            Err(err) => Err(err),
        }
    }

    fn commit(&mut self) -> StorageResult<()> {
        match self.txn.take() {
            Some(Txn::Write(txn)) => {
                if let Err(err) = txn.commit() {
                    let err = StorageError::from(err);
                    if err.is_map_full() {
                        self.recover_from_map_full()?;
                        return self.commit();
                    }
                    error!(%err, lost = self.uncommitted.len(), "commit failed; pending writes discarded");
                    self.uncommitted.clear();
                    self.txn_started = None;
                    return Err(err);
                }
                debug!(writes = self.uncommitted.len(), "committed repository transaction");
                self.stats.record_commit();
            }
            Some(Txn::Read(txn)) => drop(txn),
            None => {}
        }
        self.uncommitted.clear();
        self.txn_started = None;
        Ok(())
    }
}
