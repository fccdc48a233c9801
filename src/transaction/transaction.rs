use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use super::lock_manager::{LockGrant, LockManager, LockMode, LockTarget};
use super::txn::{IsolationLevel, Txn, TxnConfig, TxnState};
use crate::cleaner::EntryKind;
use crate::common::{DatabaseID, Durability, EnvironmentConfig, LogTreeError, Lsn, Result, TransactionID};
use crate::log_mod::{now_ms, FlushPolicy, LogEntry, LogManager, TxnEndEntry};
use crate::tree::DatabaseRegistry;

impl From<Durability> for FlushPolicy {
    fn from(durability: Durability) -> Self {
        match durability {
            Durability::Sync => FlushPolicy::Sync,
            Durability::WriteNoSync => FlushPolicy::Write,
            Durability::NoSync => FlushPolicy::None,
        }
    }
}

#[derive(Debug, Default)]
struct TxnStats {
    begins: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    lns_undone: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnStatsSnapshot {
    pub begins: u64,
    pub commits: u64,
    pub aborts: u64,
    pub lns_undone: u64,
    pub active: usize,
}

impl fmt::Display for TxnStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Transactions:")?;
        writeln!(f, "  Begun: {}", self.begins)?;
        writeln!(f, "  Committed: {}", self.commits)?;
        writeln!(f, "  Aborted: {}", self.aborts)?;
        writeln!(f, "  Records undone: {}", self.lns_undone)?;
        writeln!(f, "  Active: {}", self.active)
    }
}

/// What a commit leaves for the background services.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub lsn: Option<Lsn>,
    pub deleted: Vec<(DatabaseID, Vec<u8>)>,
}

/// Rolls back a chain of record writes, newest first, by following each
/// entry's link to the previous one. Returns the LSNs undone.
pub fn undo_chain(log: &LogManager, registry: &DatabaseRegistry, last_lsn: Option<Lsn>) -> Result<Vec<Lsn>> {
    let mut undone = Vec::new();
    let mut next = last_lsn;
    while let Some(lsn) = next {
        match log.read(lsn)? {
            LogEntry::Ln(entry) => {
                registry.undo(lsn, &entry)?;
                undone.push(lsn);
                next = entry.prev_lsn;
            }
            other => {
                return Err(LogTreeError::corruption(
                    lsn,
                    format!("transaction chain reached a {:?} entry", other.entry_type()),
                ))
            }
        }
    }
    Ok(undone)
}

pub struct TransactionManager {
    log: Arc<LogManager>,
    locks: Arc<LockManager>,
    active: Mutex<HashMap<TransactionID, Arc<Txn>>>,
    last_txn_id: AtomicU64,
    default_durability: Durability,
    default_lock_timeout: Duration,
    default_txn_timeout: Duration,
    stats: TxnStats,
}

impl TransactionManager {
    pub fn new(log: Arc<LogManager>, locks: Arc<LockManager>, config: &EnvironmentConfig, last_txn_id: u64) -> Self {
        Self {
            log,
            locks,
            active: Mutex::new(HashMap::new()),
            last_txn_id: AtomicU64::new(last_txn_id),
            default_durability: config.durability,
            default_lock_timeout: config.lock_timeout,
            default_txn_timeout: config.txn_timeout,
            stats: TxnStats::default(),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn begin(&self, config: &TxnConfig) -> Arc<Txn> {
        let id = TransactionID(self.last_txn_id.fetch_add(1, Ordering::AcqRel) + 1);
        let txn_timeout = config
            .txn_timeout
            .or(Some(self.default_txn_timeout))
            .filter(|timeout| !timeout.is_zero());
        let txn = Arc::new(Txn::new(
            id,
            config.durability.unwrap_or(self.default_durability),
            config.isolation,
            config.lock_timeout.unwrap_or(self.default_lock_timeout),
            txn_timeout,
            config.no_wait,
        ));
        self.active.lock().insert(id, txn.clone());
        self.stats.begins.fetch_add(1, Ordering::Relaxed);
        debug!("Began {}", id);
        txn
    }

    /// Locks `target` for `txn`. A conflict dooms the transaction: only
    /// abort is accepted afterwards.
    pub fn lock(&self, txn: &Txn, target: &LockTarget, mode: LockMode) -> Result<LockGrant> {
        txn.check_active()?;
        let result = if txn.no_wait() {
            self.locks.lock_no_wait(txn.id(), target, mode)
        } else {
            self.locks.lock(txn.id(), target, mode, txn.lock_timeout())
        };
        if let Err(e) = &result {
            if e.is_lock_conflict() {
                txn.set_must_abort();
            }
        }
        result
    }

    /// Takes the lock a read needs under the transaction's isolation, if
    /// any. Returns whether the lock should be dropped after the read.
    pub fn lock_for_read(&self, txn: &Txn, target: &LockTarget) -> Result<bool> {
        match txn.isolation() {
            IsolationLevel::ReadUncommitted => {
                txn.check_active()?;
                Ok(false)
            }
            IsolationLevel::Serializable => {
                self.lock(txn, target, LockMode::Read)?;
                Ok(false)
            }
            IsolationLevel::ReadCommitted => {
                let grant = self.lock(txn, target, LockMode::Read)?;
                Ok(grant == LockGrant::New)
            }
        }
    }

    pub fn release(&self, txn: &Txn, target: &LockTarget) {
        self.locks.release(txn.id(), target);
    }

    pub fn commit(&self, txn: &Txn, durability: Option<Durability>) -> Result<CommitOutcome> {
        txn.begin_commit()?;
        let durability = durability.unwrap_or_else(|| txn.durability());

        let lsn = match txn.last_lsn() {
            Some(last_lsn) => {
                let entry = LogEntry::TxnCommit(TxnEndEntry {
                    txn: txn.id(),
                    last_lsn: Some(last_lsn),
                    time_ms: now_ms(),
                });
                match self.log.append(&entry, durability.into()) {
                    Ok(lsn) => Some(lsn),
                    Err(e) => {
                        txn.finish(TxnState::MustAbort);
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let (superseded, deleted) = txn.take_commit_work();
        self.log.tracker().count_obsolete_all(&superseded, EntryKind::Ln);
        self.end(txn, TxnState::Committed);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        debug!("Committed {} at {:?}", txn.id(), lsn);
        Ok(CommitOutcome { lsn, deleted })
    }

    /// Undoes every write of `txn`, logs the abort and releases its locks.
    pub fn abort(&self, txn: &Txn, registry: &DatabaseRegistry) -> Result<()> {
        txn.begin_abort()?;
        let last_lsn = txn.last_lsn();

        let undone = undo_chain(&self.log, registry, last_lsn)?;
        self.log.tracker().count_obsolete_all(&undone, EntryKind::Ln);
        if last_lsn.is_some() {
            let entry = LogEntry::TxnAbort(TxnEndEntry {
                txn: txn.id(),
                last_lsn,
                time_ms: now_ms(),
            });
            self.log.append(&entry, FlushPolicy::None)?;
        }

        self.end(txn, TxnState::Aborted);
        self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .lns_undone
            .fetch_add(undone.len() as u64, Ordering::Relaxed);
        if !undone.is_empty() {
            warn!("Aborted {}, undid {} records", txn.id(), undone.len());
        }
        Ok(())
    }

    fn end(&self, txn: &Txn, state: TxnState) {
        self.locks.release_all(txn.id());
        self.active.lock().remove(&txn.id());
        txn.finish(state);
    }

    /// Registers `txn` as writing before its record is logged, so a
    /// checkpoint starting in between still recovers from before it.
    pub fn reserve_first_lsn(&self, txn: &Txn) {
        txn.reserve_first_lsn(self.log.end_of_log());
    }

    /// LSN of the first write of the oldest transaction still running.
    pub fn first_active_lsn(&self) -> Option<Lsn> {
        self.active.lock().values().filter_map(|txn| txn.first_lsn()).min()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn last_txn_id(&self) -> u64 {
        self.last_txn_id.load(Ordering::Acquire)
    }

    pub fn bump_txn_id(&self, seen: u64) {
        self.last_txn_id.fetch_max(seen, Ordering::AcqRel);
    }

    pub fn stats(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begins: self.stats.begins.load(Ordering::Relaxed),
            commits: self.stats.commits.load(Ordering::Relaxed),
            aborts: self.stats.aborts.load(Ordering::Relaxed),
            lns_undone: self.stats.lns_undone.load(Ordering::Relaxed),
            active: self.active_count(),
        }
    }
}
