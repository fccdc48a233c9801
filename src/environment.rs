use std::fmt;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::cleaner::{CleanReport, Cleaner, CleanerStatsSnapshot, UtilizationTracker};
use crate::common::{
    DaemonThread, DatabaseID, Durability, EnvValidity, EnvironmentConfig, LogTreeError, Lsn, Result, TransactionID,
};
use crate::log_mod::{verify_log, LnEntry, LogManager, LogReader, LogStatsSnapshot, VerifyReport};
use crate::recovery::{
    validate_tail, CheckpointReport, Checkpointer, CheckpointerStatsSnapshot, RecoveryManager, RecoveryReport,
};
use crate::storage::FileManager;
use crate::transaction::{
    LockManager, LockMode, LockStatsSnapshot, LockTarget, TransactionManager, Txn, TxnConfig, TxnState, TxnStatsSnapshot,
};
use crate::tree::{
    CacheStatsSnapshot, Compressor, CompressorStatsSnapshot, Cursor, DatabaseRegistry, EvictReport, Evictor,
    EvictorStatsSnapshot, NodeCache, Tree, TreeContext, TreeStatsSnapshot, WriteOutcome,
};

/// Everything an environment shares with its open transactions.
struct EnvInner {
    path: PathBuf,
    config: EnvironmentConfig,
    validity: Arc<EnvValidity>,
    closed: AtomicBool,
    files: Arc<FileManager>,
    log: Arc<LogManager>,
    cache: Arc<NodeCache>,
    registry: Arc<DatabaseRegistry>,
    txns: Arc<TransactionManager>,
    cleaner: Arc<Cleaner>,
    checkpointer: Arc<Checkpointer>,
    evictor: Arc<Evictor>,
    compressor: Arc<Compressor>,
}

impl EnvInner {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogTreeError::Closed);
        }
        self.validity.check()
    }

    fn read(&self, txn: &Txn, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let target = LockTarget::new(tree.db(), key);
        let release = self.txns.lock_for_read(txn, &target)?;
        let result = tree.get(key);
        if release {
            self.txns.release(txn, &target);
        }
        result
    }

    /// Writes `data` for `key`, or deletes it when `data` is None. Returns
    /// false when a delete found nothing to remove.
    fn write(&self, txn: &Txn, tree: &Tree, key: &[u8], data: Option<&[u8]>) -> Result<bool> {
        let Some(outcome) = self.log_write(txn, tree, key, data)? else {
            return Ok(false);
        };
        let deleted_key = if data.is_none() { Some(key) } else { None };
        txn.record_write(outcome.lsn, outcome.previous.map(|slot| slot.lsn), tree.db(), deleted_key);
        self.evict_if_critical()?;
        Ok(true)
    }

    /// Locks the record, then logs and installs the new version. The
    /// transaction is registered as active before anything is logged.
    fn log_write(&self, txn: &Txn, tree: &Tree, key: &[u8], data: Option<&[u8]>) -> Result<Option<WriteOutcome>> {
        let db = tree.db();
        self.txns.lock(txn, &LockTarget::new(db, key), LockMode::Write)?;
        self.txns.reserve_first_lsn(txn);

        tree.write(key, data, |previous| {
            let exists = previous.map_or(false, |slot| !slot.known_deleted);
            if data.is_none() && !exists {
                return Ok(None);
            }
            Ok(Some(LnEntry {
                db,
                key: key.to_vec(),
                data: data.map(<[u8]>::to_vec),
                txn: Some(txn.id()),
                prev_lsn: txn.chain_tail(),
                abort_lsn: previous.map(|slot| slot.lsn),
                abort_known_deleted: previous.map_or(false, |slot| slot.known_deleted),
            }))
        })
    }

    /// Evicts inline when the cache is well past its budget and the
    /// evictor daemon has not kept up.
    fn evict_if_critical(&self) -> Result<()> {
        let budget = self.cache.budget();
        if self.cache.memory_usage() > budget.saturating_add(budget / 10) {
            self.evictor.evict()?;
        }
        Ok(())
    }

    fn commit(&self, txn: &Txn, durability: Option<Durability>) -> Result<Option<Lsn>> {
        let outcome = self.txns.commit(txn, durability)?;
        for (db, key) in outcome.deleted {
            self.compressor.enqueue(db, key);
        }
        Ok(outcome.lsn)
    }

    fn abort(&self, txn: &Txn) -> Result<()> {
        self.txns.abort(txn, &self.registry)
    }

    /// Runs `op` in a short internal transaction.
    fn auto_commit<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Txn) -> Result<T>,
    {
        self.check()?;
        let txn = self.txns.begin(&TxnConfig::default());
        let result = op(&txn).and_then(|value| self.commit(&txn, None).map(|_| value));
        if result.is_err() && !txn.state().is_terminal() {
            if let Err(e) = self.abort(&txn) {
                error!("Failed to abort auto-commit {}: {}", txn.id(), e);
            }
        }
        self.validity.guard(result)
    }
}

/// A named tree opened in an environment.
#[derive(Clone)]
pub struct Database {
    tree: Arc<Tree>,
}

impl Database {
    pub fn id(&self) -> DatabaseID {
        self.tree.db()
    }

    pub fn name(&self) -> &str {
        self.tree.name()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// An application transaction. Dropping it without committing aborts it.
pub struct Transaction {
    inner: Arc<EnvInner>,
    txn: Arc<Txn>,
}

impl Transaction {
    pub fn id(&self) -> TransactionID {
        self.txn.id()
    }

    pub fn state(&self) -> TxnState {
        self.txn.state()
    }

    /// Commits with the transaction's own durability. Returns the LSN of
    /// the commit record, or None if the transaction wrote nothing.
    pub fn commit(self) -> Result<Option<Lsn>> {
        self.finish_commit(None)
    }

    pub fn commit_with(self, durability: Durability) -> Result<Option<Lsn>> {
        self.finish_commit(Some(durability))
    }

    fn finish_commit(self, durability: Option<Durability>) -> Result<Option<Lsn>> {
        self.inner.check()?;
        let result = self.inner.commit(&self.txn, durability);
        self.inner.validity.guard(result)
    }

    pub fn abort(self) -> Result<()> {
        self.inner.check()?;
        let result = self.inner.abort(&self.txn);
        self.inner.validity.guard(result)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.txn.state().is_terminal() || self.inner.check().is_err() {
            return;
        }
        warn!("{} dropped while {}, aborting", self.txn.id(), self.txn.state());
        if let Err(e) = self.inner.abort(&self.txn) {
            error!("Failed to abort {}: {}", self.txn.id(), e);
            self.inner.validity.guard::<()>(Err(e)).ok();
        }
    }
}

/// Iterator over the live records of a key range, in key order. Reads
/// take no locks.
pub struct Scan {
    tree: Arc<Tree>,
    cursor: Cursor,
}

impl Iterator for Scan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.cursor.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let data = match entry.data {
                Some(data) => Some(data),
                None => match self.tree.fetch_ln_data(entry.lsn) {
                    Ok(data) => data,
                    Err(e) => return Some(Err(e)),
                },
            };
            if let Some(data) = data {
                return Some(Ok((entry.key, data)));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvStatsSnapshot {
    pub log: LogStatsSnapshot,
    pub cache: CacheStatsSnapshot,
    pub tree: TreeStatsSnapshot,
    pub txns: TxnStatsSnapshot,
    pub locks: LockStatsSnapshot,
    pub checkpointer: CheckpointerStatsSnapshot,
    pub cleaner: CleanerStatsSnapshot,
    pub evictor: EvictorStatsSnapshot,
    pub compressor: CompressorStatsSnapshot,
    pub databases: usize,
    /// Live share of the log, in percent
    pub utilization: u32,
}

impl fmt::Display for EnvStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Environment: {} databases, log utilization {}%", self.databases, self.utilization)?;
        writeln!(f, "{}", self.log)?;
        write!(f, "{}", self.cache)?;
        write!(f, "{}", self.tree)?;
        write!(f, "{}", self.txns)?;
        write!(f, "{}", self.locks)?;
        write!(f, "{}", self.checkpointer)?;
        write!(f, "{}", self.cleaner)?;
        write!(f, "{}", self.evictor)?;
        write!(f, "{}", self.compressor)
    }
}

/// An open environment: one log directory holding any number of named
/// trees. Recovery runs inside [`Environment::open`].
pub struct Environment {
    inner: Arc<EnvInner>,
    daemons: Mutex<Vec<DaemonThread>>,
    recovery: Option<RecoveryReport>,
}

impl Environment {
    pub fn open(path: &Path, config: EnvironmentConfig) -> Result<Self> {
        config.validate()?;
        let files = Arc::new(FileManager::open(path)?);
        let tail = validate_tail(&files)?;

        let env_id = tail.map(|tail| tail.env_id).unwrap_or_else(Uuid::new_v4);
        let tracker = Arc::new(UtilizationTracker::new());
        let log = Arc::new(LogManager::open(
            files.clone(),
            &config,
            tracker,
            tail.map(|tail| tail.end),
            env_id,
        )?);

        let cache = Arc::new(NodeCache::new(config.cache_size));
        let ctx = Arc::new(TreeContext::new(log.clone(), cache.clone(), &config, 0));
        let registry = Arc::new(DatabaseRegistry::new(ctx, 0));
        let locks = Arc::new(LockManager::new());
        let txns = Arc::new(TransactionManager::new(log.clone(), locks.clone(), &config, 0));
        let cleaner = Arc::new(Cleaner::new(log.clone(), registry.clone(), locks.clone(), &config));
        let checkpointer = Arc::new(Checkpointer::new(
            log.clone(),
            registry.clone(),
            txns.clone(),
            cleaner.clone(),
            &config,
        ));
        let evictor = Arc::new(Evictor::new(registry.clone(), cache.clone()));
        let compressor = Arc::new(Compressor::new(registry.clone(), locks));

        let recovery = match &tail {
            Some(tail) => {
                let report = RecoveryManager::new(log.clone(), registry.clone(), txns.clone()).recover(tail)?;
                for (db, key) in &report.deleted_keys {
                    compressor.enqueue(*db, key.clone());
                }
                info!("Recovered environment {}\n{}", env_id, report);
                Some(report)
            }
            None => None,
        };
        let invoker = if recovery.is_some() { "recovery" } else { "open" };
        checkpointer.checkpoint(invoker, true)?;

        let inner = Arc::new(EnvInner {
            path: path.to_path_buf(),
            config,
            validity: Arc::new(EnvValidity::new()),
            closed: AtomicBool::new(false),
            files,
            log,
            cache,
            registry,
            txns,
            cleaner,
            checkpointer,
            evictor,
            compressor,
        });
        let daemons = Self::spawn_daemons(&inner)?;
        info!(
            "Opened environment {} in {} with {} daemons",
            env_id,
            inner.path.display(),
            daemons.len()
        );

        Ok(Self {
            inner,
            daemons: Mutex::new(daemons),
            recovery,
        })
    }

    fn spawn_daemons(inner: &EnvInner) -> Result<Vec<DaemonThread>> {
        let interval = inner.config.daemon_interval;
        let validity = &inner.validity;
        let mut daemons = Vec::new();
        if inner.config.run_checkpointer {
            daemons.push(DaemonThread::spawn(inner.checkpointer.clone(), interval, validity.clone())?);
        }
        if inner.config.run_cleaner {
            daemons.push(DaemonThread::spawn(inner.cleaner.clone(), interval, validity.clone())?);
        }
        if inner.config.run_evictor {
            daemons.push(DaemonThread::spawn(inner.evictor.clone(), interval, validity.clone())?);
        }
        if inner.config.run_compressor {
            daemons.push(DaemonThread::spawn(inner.compressor.clone(), interval, validity.clone())?);
        }
        Ok(daemons)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn env_id(&self) -> Uuid {
        self.inner.log.env_id()
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.inner.config
    }

    /// What recovery did when this environment was opened over an
    /// existing log.
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Opens the named tree, creating it if it does not exist.
    pub fn open_database(&self, name: &str) -> Result<Database> {
        self.inner.check()?;
        let tree = self.inner.validity.guard(self.inner.registry.open_or_create(name))?;
        Ok(Database { tree })
    }

    /// Opens an existing tree without creating it.
    pub fn existing_database(&self, name: &str) -> Result<Database> {
        self.inner.check()?;
        self.inner
            .registry
            .get_by_name(name)
            .map(|tree| Database { tree })
            .ok_or_else(|| LogTreeError::DatabaseNotFound(name.to_string()))
    }

    pub fn database_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn begin_txn(&self, config: TxnConfig) -> Result<Transaction> {
        self.inner.check()?;
        Ok(Transaction {
            inner: self.inner.clone(),
            txn: self.inner.txns.begin(&config),
        })
    }

    pub fn get(&self, txn: Option<&Transaction>, db: &Database, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match txn {
            Some(txn) => {
                self.inner.check()?;
                let result = self.inner.read(&txn.txn, &db.tree, key);
                self.inner.validity.guard(result)
            }
            None => self.inner.auto_commit(|txn| self.inner.read(txn, &db.tree, key)),
        }
    }

    pub fn put(&self, txn: Option<&Transaction>, db: &Database, key: &[u8], data: &[u8]) -> Result<()> {
        match txn {
            Some(txn) => {
                self.inner.check()?;
                let result = self.inner.write(&txn.txn, &db.tree, key, Some(data));
                self.inner.validity.guard(result).map(|_| ())
            }
            None => self
                .inner
                .auto_commit(|txn| self.inner.write(txn, &db.tree, key, Some(data)))
                .map(|_| ()),
        }
    }

    /// Deletes `key`. Returns whether it existed.
    pub fn delete(&self, txn: Option<&Transaction>, db: &Database, key: &[u8]) -> Result<bool> {
        match txn {
            Some(txn) => {
                self.inner.check()?;
                let result = self.inner.write(&txn.txn, &db.tree, key, None);
                self.inner.validity.guard(result)
            }
            None => self.inner.auto_commit(|txn| self.inner.write(txn, &db.tree, key, None)),
        }
    }

    pub fn scan<R: RangeBounds<Vec<u8>>>(&self, db: &Database, range: R) -> Result<Scan> {
        self.inner.check()?;
        Ok(Scan {
            tree: db.tree.clone(),
            cursor: Cursor::new(db.tree.clone(), range),
        })
    }

    /// Runs a checkpoint now if one is due, or unconditionally with `force`.
    pub fn checkpoint(&self, force: bool) -> Result<Option<CheckpointReport>> {
        self.inner.check()?;
        let result = self.inner.checkpointer.checkpoint("api", force);
        self.inner.validity.guard(result)
    }

    /// Cleans log files until none qualifies. The cleaned files are
    /// deleted by the next checkpoint.
    pub fn clean_log(&self) -> Result<CleanReport> {
        self.inner.check()?;
        let mut total = CleanReport::default();
        loop {
            let report = self.inner.validity.guard(self.inner.cleaner.clean())?;
            total.lns_migrated += report.lns_migrated;
            total.ins_migrated += report.ins_migrated;
            total.entries_obsolete += report.entries_obsolete;
            total.files_pending = report.files_pending;
            if report.files_cleaned.is_empty() {
                break;
            }
            total.files_cleaned.extend(report.files_cleaned);
        }
        Ok(total)
    }

    /// Removes committed deletions from the trees. Returns the number of
    /// slots removed.
    pub fn compress(&self) -> Result<usize> {
        self.inner.check()?;
        self.inner.validity.guard(self.inner.compressor.compress())
    }

    pub fn evict(&self) -> Result<EvictReport> {
        self.inner.check()?;
        self.inner.validity.guard(self.inner.evictor.evict())
    }

    /// Forces every logged entry to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.check()?;
        self.inner.validity.guard(self.inner.log.sync())
    }

    pub fn end_of_log(&self) -> Lsn {
        self.inner.log.end_of_log()
    }

    /// Keeps the cleaner away from `file` and everything after it, so a
    /// reader of the log stream does not lose entries it has yet to see.
    pub fn set_protected_file(&self, file: Option<u32>) {
        self.inner.cleaner.set_protected_file(file);
    }

    /// Reads the log from `start` onward, stopping at what has been
    /// written out so far.
    pub fn log_entries(&self, start: Lsn) -> Result<LogReader<'_>> {
        self.inner.check()?;
        let end = self.inner.validity.guard(self.inner.log.flush())?;
        LogReader::new(&self.inner.files, start, Some(end))
    }

    pub fn verify_log(&self) -> Result<VerifyReport> {
        self.inner.check()?;
        self.inner.validity.guard(self.inner.log.flush())?;
        self.inner.validity.guard(verify_log(&self.inner.files))
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.validity.is_invalid()
    }

    pub fn stats(&self) -> EnvStatsSnapshot {
        EnvStatsSnapshot {
            log: self.inner.log.stats(),
            cache: self.inner.cache.stats(),
            tree: self.inner.registry.context().stats(),
            txns: self.inner.txns.stats(),
            locks: self.inner.txns.lock_manager().stats(),
            checkpointer: self.inner.checkpointer.stats(),
            cleaner: self.inner.cleaner.stats(),
            evictor: self.inner.evictor.stats(),
            compressor: self.inner.compressor.stats(),
            databases: self.inner.registry.names().len(),
            utilization: self.inner.log.tracker().total_utilization(),
        }
    }

    fn stop_daemons(&self) {
        for mut daemon in self.daemons.lock().drain(..) {
            daemon.shutdown();
        }
    }

    /// Checkpoints and closes the environment. The next open has no
    /// recovery work beyond the final checkpoint.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_daemons();

        let active = self.inner.txns.active_count();
        if active > 0 {
            warn!("Closing environment with {} open transactions", active);
        }
        let result = if self.inner.validity.is_invalid() {
            Ok(())
        } else {
            self.inner
                .checkpointer
                .checkpoint("close", true)
                .and_then(|_| self.inner.log.sync())
        };
        self.inner.files.close_all();
        info!("Closed environment in {}", self.inner.path.display());
        result
    }

    /// Closes without a checkpoint and drops whatever is still buffered,
    /// leaving the directory as a crash would.
    pub fn abnormal_close(self) {
        self.inner.closed.store(true, Ordering::Release);
        self.stop_daemons();
        self.inner.log.discard_buffers();
        self.inner.files.close_all();
        warn!("Environment in {} closed abnormally", self.inner.path.display());
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to close environment: {}", e);
        }
    }
}
