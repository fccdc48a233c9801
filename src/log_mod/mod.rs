pub(crate) mod entry;
mod fsync_manager;
mod header;
mod log_manager;
mod reader;
mod verify;

pub use entry::{
    CkptEndEntry, CkptStartEntry, DbRootInfo, FileHeaderEntry, FileSummariesEntry, InDeltaEntry, InEntry,
    LnEntry, LogEntry, LogEntryType, NodeSlot, TraceEntry, TxnEndEntry, now_ms,
};
pub use fsync_manager::FSyncManager;
pub use header::LogEntryHeader;
pub use log_manager::{FlushPolicy, LogEnd, LogManager, LogStatsSnapshot};
pub use reader::{decode_entry, BackwardReader, LogItem, LogReader};
pub use verify::{truncate_log, verify_log, VerifyReport};
