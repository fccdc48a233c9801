use thiserror::Error;

use super::{Lsn, TransactionID};

#[derive(Debug, Error)]
pub enum LogTreeError {
    #[error("Checksum mismatch at {lsn}: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { lsn: Lsn, stored: u32, computed: u32 },

    #[error("Log corruption at {lsn}: {reason}")]
    Corruption { lsn: Lsn, reason: String },

    #[error("Lock timeout: {txn} waited {waited_ms}ms for {mode} lock on {target}")]
    LockTimeout {
        txn: TransactionID,
        target: String,
        mode: String,
        waited_ms: u64,
    },

    #[error("Lock not available: {txn} requested {mode} lock on {target}")]
    LockNotAvailable {
        txn: TransactionID,
        target: String,
        mode: String,
    },

    #[error("Transaction {txn} exceeded its timeout of {timeout_ms}ms")]
    TxnTimeout { txn: TransactionID, timeout_ms: u64 },

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Log buffer full: entry of {0} bytes cannot be buffered")]
    BufferFull(usize),

    #[error("Invalid transaction state: {txn} is {state}")]
    InvalidTxnState { txn: TransactionID, state: String },

    #[error("Environment invalid: {0}")]
    EnvironmentInvalid(String),

    #[error("Database {0} not found")]
    DatabaseNotFound(String),

    #[error("Environment is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LogTreeError {
    /// Errors after which the environment can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogTreeError::Checksum { .. }
                | LogTreeError::Corruption { .. }
                | LogTreeError::IOError(_)
                | LogTreeError::EnvironmentInvalid(_)
        )
    }

    /// Errors that only doom the transaction that hit them.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(
            self,
            LogTreeError::LockTimeout { .. }
                | LogTreeError::LockNotAvailable { .. }
                | LogTreeError::TxnTimeout { .. }
        )
    }

    pub(crate) fn corruption(lsn: Lsn, reason: impl Into<String>) -> Self {
        LogTreeError::Corruption {
            lsn,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LogTreeError>;
