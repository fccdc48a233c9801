use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cleaner::FileSummary;
use crate::common::{DatabaseID, Lsn, NodeID, Result, TransactionID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEntryType {
    FileHeader = 0,
    Ln = 1,
    In = 2,
    InDelta = 3,
    TxnCommit = 4,
    TxnAbort = 5,
    CkptStart = 6,
    CkptEnd = 7,
    FileSummaries = 8,
    DbRoot = 9,
    Trace = 10,
}

impl LogEntryType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LogEntryType::FileHeader),
            1 => Some(LogEntryType::Ln),
            2 => Some(LogEntryType::In),
            3 => Some(LogEntryType::InDelta),
            4 => Some(LogEntryType::TxnCommit),
            5 => Some(LogEntryType::TxnAbort),
            6 => Some(LogEntryType::CkptStart),
            7 => Some(LogEntryType::CkptEnd),
            8 => Some(LogEntryType::FileSummaries),
            9 => Some(LogEntryType::DbRoot),
            10 => Some(LogEntryType::Trace),
            _ => None,
        }
    }

    /// Node entries stay live while the tree references them; everything
    /// else is obsolete as soon as it is written.
    pub fn is_node(&self) -> bool {
        matches!(self, LogEntryType::In | LogEntryType::InDelta)
    }

    pub fn is_ln(&self) -> bool {
        matches!(self, LogEntryType::Ln)
    }
}

/// A record write or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LnEntry {
    pub db: DatabaseID,
    pub key: Vec<u8>,
    /// None for a delete
    pub data: Option<Vec<u8>>,
    /// None for entries written outside a transaction (cleaner migration)
    pub txn: Option<TransactionID>,
    /// Previous entry of the same transaction
    pub prev_lsn: Option<Lsn>,
    /// Slot LSN before this write; None if the key did not exist
    pub abort_lsn: Option<Lsn>,
    pub abort_known_deleted: bool,
}

impl LnEntry {
    pub fn is_deletion(&self) -> bool {
        self.data.is_none()
    }
}

/// One slot of a logged node. `child` is set for index nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSlot {
    pub key: Vec<u8>,
    pub child: Option<NodeID>,
    pub lsn: Lsn,
    pub known_deleted: bool,
}

/// Full image of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InEntry {
    pub node_id: NodeID,
    pub db: DatabaseID,
    /// 1 for a BIN
    pub level: u8,
    pub identifier_key: Vec<u8>,
    pub slots: Vec<NodeSlot>,
}

impl InEntry {
    pub fn is_bin(&self) -> bool {
        self.level == 1
    }
}

/// The BIN slots changed since the full image at `base_lsn`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InDeltaEntry {
    pub node_id: NodeID,
    pub db: DatabaseID,
    pub identifier_key: Vec<u8>,
    pub base_lsn: Lsn,
    pub slots: Vec<NodeSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnEndEntry {
    pub txn: TransactionID,
    pub last_lsn: Option<Lsn>,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CkptStartEntry {
    pub invoker: String,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRootInfo {
    pub db: DatabaseID,
    pub name: String,
    pub root_id: NodeID,
    pub root_lsn: Lsn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CkptEndEntry {
    pub invoker: String,
    pub start_lsn: Lsn,
    pub first_active_lsn: Option<Lsn>,
    pub last_node_id: u64,
    pub last_db_id: u32,
    pub last_txn_id: u64,
    pub roots: Vec<DbRootInfo>,
    pub summaries_lsn: Option<Lsn>,
    pub time_ms: u64,
}

impl CkptEndEntry {
    /// Where a recovery based on this checkpoint has to start scanning.
    pub fn recovery_start(&self) -> Lsn {
        match self.first_active_lsn {
            Some(first_active) if first_active < self.start_lsn => first_active,
            _ => self.start_lsn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummariesEntry {
    pub summaries: Vec<(u32, FileSummary)>,
    /// Entries before this LSN are included in the summaries
    pub end_of_log: Lsn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub message: String,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeaderEntry {
    pub magic: u32,
    pub version: u8,
    pub file_number: u32,
    pub created_ms: u64,
    pub env_id: Uuid,
    /// Offset of the last entry of the previous file
    pub prev_file_last_offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    FileHeader(FileHeaderEntry),
    Ln(LnEntry),
    In(InEntry),
    InDelta(InDeltaEntry),
    TxnCommit(TxnEndEntry),
    TxnAbort(TxnEndEntry),
    CkptStart(CkptStartEntry),
    CkptEnd(CkptEndEntry),
    FileSummaries(FileSummariesEntry),
    DbRoot(DbRootInfo),
    Trace(TraceEntry),
}

impl LogEntry {
    pub fn entry_type(&self) -> LogEntryType {
        match self {
            LogEntry::FileHeader(_) => LogEntryType::FileHeader,
            LogEntry::Ln(_) => LogEntryType::Ln,
            LogEntry::In(_) => LogEntryType::In,
            LogEntry::InDelta(_) => LogEntryType::InDelta,
            LogEntry::TxnCommit(_) => LogEntryType::TxnCommit,
            LogEntry::TxnAbort(_) => LogEntryType::TxnAbort,
            LogEntry::CkptStart(_) => LogEntryType::CkptStart,
            LogEntry::CkptEnd(_) => LogEntryType::CkptEnd,
            LogEntry::FileSummaries(_) => LogEntryType::FileSummaries,
            LogEntry::DbRoot(_) => LogEntryType::DbRoot,
            LogEntry::Trace(_) => LogEntryType::Trace,
        }
    }

    /// Transaction that wrote the entry, if any.
    pub fn txn_id(&self) -> Option<TransactionID> {
        match self {
            LogEntry::Ln(ln) => ln.txn,
            LogEntry::TxnCommit(end) | LogEntry::TxnAbort(end) => Some(end.txn),
            _ => None,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            LogEntry::FileHeader(e) => bincode::serialize(e)?,
            LogEntry::Ln(e) => bincode::serialize(e)?,
            LogEntry::In(e) => bincode::serialize(e)?,
            LogEntry::InDelta(e) => bincode::serialize(e)?,
            LogEntry::TxnCommit(e) | LogEntry::TxnAbort(e) => bincode::serialize(e)?,
            LogEntry::CkptStart(e) => bincode::serialize(e)?,
            LogEntry::CkptEnd(e) => bincode::serialize(e)?,
            LogEntry::FileSummaries(e) => bincode::serialize(e)?,
            LogEntry::DbRoot(e) => bincode::serialize(e)?,
            LogEntry::Trace(e) => bincode::serialize(e)?,
        };
        Ok(bytes)
    }

    pub fn decode_payload(entry_type: LogEntryType, payload: &[u8]) -> Result<Self> {
        let entry = match entry_type {
            LogEntryType::FileHeader => LogEntry::FileHeader(bincode::deserialize(payload)?),
            LogEntryType::Ln => LogEntry::Ln(bincode::deserialize(payload)?),
            LogEntryType::In => LogEntry::In(bincode::deserialize(payload)?),
            LogEntryType::InDelta => LogEntry::InDelta(bincode::deserialize(payload)?),
            LogEntryType::TxnCommit => LogEntry::TxnCommit(bincode::deserialize(payload)?),
            LogEntryType::TxnAbort => LogEntry::TxnAbort(bincode::deserialize(payload)?),
            LogEntryType::CkptStart => LogEntry::CkptStart(bincode::deserialize(payload)?),
            LogEntryType::CkptEnd => LogEntry::CkptEnd(bincode::deserialize(payload)?),
            LogEntryType::FileSummaries => LogEntry::FileSummaries(bincode::deserialize(payload)?),
            LogEntryType::DbRoot => LogEntry::DbRoot(bincode::deserialize(payload)?),
            LogEntryType::Trace => LogEntry::Trace(bincode::deserialize(payload)?),
        };
        Ok(entry)
    }

    pub fn trace(message: impl Into<String>) -> Self {
        LogEntry::Trace(TraceEntry {
            message: message.into(),
            time_ms: now_ms(),
        })
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_are_stable() {
        for code in 0u8..=10 {
            let entry_type = LogEntryType::from_u8(code).unwrap();
            assert_eq!(entry_type as u8, code);
        }
        assert_eq!(LogEntryType::from_u8(11), None);
        assert!(LogEntryType::InDelta.is_node());
        assert!(!LogEntryType::TxnCommit.is_node());
    }

    #[test]
    fn test_ln_payload_decodes() {
        let entry = LogEntry::Ln(LnEntry {
            db: DatabaseID(3),
            key: b"key".to_vec(),
            data: None,
            txn: Some(TransactionID(9)),
            prev_lsn: Some(Lsn::new(0, 40)),
            abort_lsn: Some(Lsn::new(0, 20)),
            abort_known_deleted: false,
        });
        let payload = entry.encode_payload().unwrap();
        let decoded = LogEntry::decode_payload(LogEntryType::Ln, &payload).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.txn_id(), Some(TransactionID(9)));
    }

    #[test]
    fn test_recovery_start_prefers_older_active_txn() {
        let mut end = CkptEndEntry {
            invoker: "test".to_string(),
            start_lsn: Lsn::new(2, 100),
            first_active_lsn: None,
            last_node_id: 0,
            last_db_id: 0,
            last_txn_id: 0,
            roots: Vec::new(),
            summaries_lsn: None,
            time_ms: 0,
        };
        assert_eq!(end.recovery_start(), Lsn::new(2, 100));
        end.first_active_lsn = Some(Lsn::new(1, 500));
        assert_eq!(end.recovery_start(), Lsn::new(1, 500));
        end.first_active_lsn = Some(Lsn::new(3, 0));
        assert_eq!(end.recovery_start(), Lsn::new(2, 100));
    }
}
