use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::common::{DatabaseID, Durability, LogTreeError, Lsn, Result, TransactionID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// READ locks are held until the end of the transaction
    #[default]
    Serializable,
    /// READ locks are released after each read
    ReadCommitted,
    /// Reads take no locks and may see uncommitted data
    ReadUncommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    /// Only abort is accepted
    MustAbort,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Active => "active",
            TxnState::MustAbort => "must-abort",
            TxnState::Committing => "committing",
            TxnState::Committed => "committed",
            TxnState::Aborting => "aborting",
            TxnState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Per-transaction settings. Unset values fall back to the environment
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct TxnConfig {
    pub durability: Option<Durability>,
    pub isolation: IsolationLevel,
    pub lock_timeout: Option<Duration>,
    pub txn_timeout: Option<Duration>,
    pub no_wait: bool,
}

impl TxnConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = Some(durability);
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_txn_timeout(mut self, timeout: Duration) -> Self {
        self.txn_timeout = Some(timeout);
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }
}

#[derive(Debug)]
struct TxnInner {
    state: TxnState,
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
    // Versions replaced by this transaction, obsolete once it commits
    superseded: Vec<Lsn>,
    // Keys deleted by this transaction, handed to the compressor on commit
    deleted: Vec<(DatabaseID, Vec<u8>)>,
}

/// A transaction as the engine tracks it.
#[derive(Debug)]
pub struct Txn {
    id: TransactionID,
    durability: Durability,
    isolation: IsolationLevel,
    lock_timeout: Duration,
    txn_timeout: Option<Duration>,
    no_wait: bool,
    started: Instant,
    inner: Mutex<TxnInner>,
}

impl Txn {
    pub(crate) fn new(
        id: TransactionID,
        durability: Durability,
        isolation: IsolationLevel,
        lock_timeout: Duration,
        txn_timeout: Option<Duration>,
        no_wait: bool,
    ) -> Self {
        Self {
            id,
            durability,
            isolation,
            lock_timeout,
            txn_timeout,
            no_wait,
            started: Instant::now(),
            inner: Mutex::new(TxnInner {
                state: TxnState::Active,
                first_lsn: None,
                last_lsn: None,
                superseded: Vec::new(),
                deleted: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> TransactionID {
        self.id
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn no_wait(&self) -> bool {
        self.no_wait
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub fn first_lsn(&self) -> Option<Lsn> {
        self.inner.lock().first_lsn
    }

    pub fn last_lsn(&self) -> Option<Lsn> {
        self.inner.lock().last_lsn
    }

    fn invalid_state(&self, state: TxnState) -> LogTreeError {
        LogTreeError::InvalidTxnState {
            txn: self.id,
            state: state.to_string(),
        }
    }

    /// Fails unless the transaction can still do work. An expired
    /// transaction is moved to MustAbort.
    pub fn check_active(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TxnState::Active {
            return Err(self.invalid_state(inner.state));
        }
        if let Some(timeout) = self.txn_timeout {
            if self.started.elapsed() > timeout {
                inner.state = TxnState::MustAbort;
                return Err(LogTreeError::TxnTimeout {
                    txn: self.id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn set_must_abort(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TxnState::Active {
            inner.state = TxnState::MustAbort;
        }
    }

    /// Moves Active to Committing.
    pub(crate) fn begin_commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::Active => {
                inner.state = TxnState::Committing;
                Ok(())
            }
            state => Err(self.invalid_state(state)),
        }
    }

    /// Moves Active or MustAbort to Aborting.
    pub(crate) fn begin_abort(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::Active | TxnState::MustAbort => {
                inner.state = TxnState::Aborting;
                Ok(())
            }
            state => Err(self.invalid_state(state)),
        }
    }

    pub(crate) fn finish(&self, state: TxnState) {
        self.inner.lock().state = state;
    }

    /// Previous LSN of this transaction's chain, to put in the next entry.
    pub(crate) fn chain_tail(&self) -> Option<Lsn> {
        self.inner.lock().last_lsn
    }

    /// Marks the transaction as writing from `next` on, before its first
    /// record is logged. The record lands at or after `next`.
    pub(crate) fn reserve_first_lsn(&self, next: Lsn) {
        let mut inner = self.inner.lock();
        if inner.first_lsn.is_none() {
            inner.first_lsn = Some(next);
        }
    }

    pub(crate) fn record_write(&self, lsn: Lsn, superseded: Option<Lsn>, db: DatabaseID, deleted_key: Option<&[u8]>) {
        let mut inner = self.inner.lock();
        if inner.first_lsn.is_none() {
            inner.first_lsn = Some(lsn);
        }
        inner.last_lsn = Some(lsn);
        if let Some(previous) = superseded {
            inner.superseded.push(previous);
        }
        if let Some(key) = deleted_key {
            inner.deleted.push((db, key.to_vec()));
        }
    }

    pub(crate) fn take_commit_work(&self) -> (Vec<Lsn>, Vec<(DatabaseID, Vec<u8>)>) {
        let mut inner = self.inner.lock();
        (
            std::mem::take(&mut inner.superseded),
            std::mem::take(&mut inner.deleted),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(timeout: Option<Duration>) -> Txn {
        Txn::new(
            TransactionID(1),
            Durability::Sync,
            IsolationLevel::Serializable,
            Duration::from_millis(100),
            timeout,
            false,
        )
    }

    #[test]
    fn test_state_transitions() {
        let t = txn(None);
        t.check_active().unwrap();
        t.begin_commit().unwrap();
        assert!(matches!(t.begin_abort(), Err(LogTreeError::InvalidTxnState { .. })));
        t.finish(TxnState::Committed);
        assert!(t.state().is_terminal());
        assert!(t.check_active().is_err());
    }

    #[test]
    fn test_must_abort_only_allows_abort() {
        let t = txn(None);
        t.set_must_abort();
        assert!(t.check_active().is_err());
        assert!(t.begin_commit().is_err());
        t.begin_abort().unwrap();
    }

    #[test]
    fn test_timeout_expires_transaction() {
        let t = txn(Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(t.check_active(), Err(LogTreeError::TxnTimeout { .. })));
        assert_eq!(t.state(), TxnState::MustAbort);
    }

    #[test]
    fn test_write_chain_bookkeeping() {
        let t = txn(None);
        t.record_write(Lsn::new(0, 100), None, DatabaseID(1), None);
        t.record_write(Lsn::new(0, 200), Some(Lsn::new(0, 100)), DatabaseID(1), Some(b"k"));
        assert_eq!(t.first_lsn(), Some(Lsn::new(0, 100)));
        assert_eq!(t.last_lsn(), Some(Lsn::new(0, 200)));

        let (superseded, deleted) = t.take_commit_work();
        assert_eq!(superseded, vec![Lsn::new(0, 100)]);
        assert_eq!(deleted, vec![(DatabaseID(1), b"k".to_vec())]);
    }
}
