mod lock_manager;
#[allow(clippy::module_inception)]
mod transaction;
mod txn;

pub use lock_manager::{LockGrant, LockManager, LockMode, LockStatsSnapshot, LockTarget};
pub use transaction::{undo_chain, CommitOutcome, TransactionManager, TxnStatsSnapshot};
pub use txn::{IsolationLevel, Txn, TxnConfig, TxnState};
