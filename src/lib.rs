pub mod buffer;
pub mod cleaner;
pub mod common;
pub mod environment;
pub mod log_mod;
pub mod recovery;
pub mod storage;
pub mod transaction;
pub mod tree;

pub use common::{DatabaseID, Durability, EnvironmentConfig, LogTreeError, Lsn, Result, TransactionID};
pub use environment::{Database, EnvStatsSnapshot, Environment, Scan, Transaction};
pub use transaction::{IsolationLevel, TxnConfig, TxnState};
