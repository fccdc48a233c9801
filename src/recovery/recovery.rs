use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::cleaner::EntryKind;
use crate::common::{DatabaseID, LogTreeError, Lsn, Result, TransactionID};
use crate::log_mod::{
    decode_entry, now_ms, BackwardReader, CkptEndEntry, FlushPolicy, LnEntry, LogEnd, LogEntry, LogItem,
    LogManager, LogReader, TxnEndEntry,
};
use crate::storage::FileManager;
use crate::transaction::{undo_chain, TransactionManager};
use crate::tree::{DatabaseRegistry, RedoOutcome};

/// Where the valid log ends, found before the log is opened for writing.
#[derive(Debug, Clone, Copy)]
pub struct LogTail {
    pub end: LogEnd,
    pub env_id: Uuid,
    /// First byte cut off, if the tail was torn
    pub truncated_at: Option<Lsn>,
}

/// Finds the end of the log. The last file is scanned entry by entry and
/// cut at the first entry that fails validation; a last file without a
/// valid header is removed. Returns None for an empty directory.
pub fn validate_tail(files: &FileManager) -> Result<Option<LogTail>> {
    let mut numbers = files.list_files()?;
    let mut truncated_at = None;

    while let Some(&last) = numbers.last() {
        let bytes = files.read_file(last)?;
        let mut offset = 0usize;
        let mut last_entry_offset = None;
        let mut env_id = None;
        let mut torn = false;

        while offset < bytes.len() {
            let lsn = Lsn::new(last, offset as u32);
            match decode_entry(&bytes[offset..], lsn) {
                Ok((header, entry)) => {
                    if offset == 0 {
                        match entry {
                            LogEntry::FileHeader(file_header) => env_id = Some(file_header.env_id),
                            _ => return Err(LogTreeError::corruption(lsn, "file does not start with a header")),
                        }
                    }
                    last_entry_offset = Some(offset as u32);
                    offset += header.entry_size();
                }
                Err(e @ (LogTreeError::Checksum { .. } | LogTreeError::Corruption { .. })) => {
                    warn!("Torn log tail at {}: {}", lsn, e);
                    torn = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let Some(env_id) = env_id else {
            warn!("Removing log file {} without a valid header", last);
            files.delete_file(last)?;
            truncated_at = Some(Lsn::new(last, 0));
            numbers.pop();
            continue;
        };
        if torn {
            files.truncate(last, offset as u64)?;
            files.sync(last)?;
            truncated_at = Some(Lsn::new(last, offset as u32));
        }
        return Ok(Some(LogTail {
            end: LogEnd {
                file: last,
                offset: offset as u32,
                last_entry_offset,
            },
            env_id,
            truncated_at,
        }));
    }
    Ok(None)
}

/// Walks backward from the end of the log to the most recent checkpoint.
pub fn find_last_checkpoint(files: &FileManager, end: &LogEnd) -> Result<Option<(Lsn, CkptEndEntry)>> {
    let Some(last_entry_offset) = end.last_entry_offset else {
        return Ok(None);
    };
    for item in BackwardReader::new(files, end.file, last_entry_offset)? {
        let item = item?;
        if let LogEntry::CkptEnd(ckpt) = item.entry {
            return Ok(Some((item.lsn, ckpt)));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub checkpoint_lsn: Option<Lsn>,
    pub recovery_start: Lsn,
    pub truncated_at: Option<Lsn>,
    pub entries_scanned: u64,
    pub nodes_redone: u64,
    pub lns_redone: u64,
    pub lns_undone: u64,
    pub txns_committed: usize,
    pub txns_aborted: usize,
    pub txns_incomplete: usize,
    /// Keys left as tombstones, for the compressor
    pub deleted_keys: Vec<(DatabaseID, Vec<u8>)>,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Recovery:")?;
        match self.checkpoint_lsn {
            Some(lsn) => writeln!(f, "  Checkpoint: {}", lsn)?,
            None => writeln!(f, "  Checkpoint: none")?,
        }
        writeln!(f, "  Started at: {}", self.recovery_start)?;
        writeln!(f, "  Entries scanned: {}", self.entries_scanned)?;
        writeln!(f, "  Nodes redone: {}", self.nodes_redone)?;
        writeln!(f, "  LNs redone: {}", self.lns_redone)?;
        writeln!(f, "  LNs undone: {}", self.lns_undone)?;
        writeln!(f, "  Committed txns: {}", self.txns_committed)?;
        writeln!(f, "  Aborted txns: {}", self.txns_aborted)?;
        writeln!(f, "  Incomplete txns: {}", self.txns_incomplete)
    }
}

#[derive(Debug, Default)]
struct Analysis {
    // Committed transactions and where their commit was logged
    committed: HashMap<TransactionID, Lsn>,
    // Aborted transactions and the last entry their abort covered
    aborted: HashMap<TransactionID, Option<Lsn>>,
    last_lsn: HashMap<TransactionID, Lsn>,
    max_node_id: u64,
    max_db_id: u32,
    max_txn_id: u64,
}

/// Rebuilds the trees and resolves transactions after the log was reopened.
pub struct RecoveryManager {
    log: Arc<LogManager>,
    registry: Arc<DatabaseRegistry>,
    txns: Arc<TransactionManager>,
}

impl RecoveryManager {
    pub fn new(log: Arc<LogManager>, registry: Arc<DatabaseRegistry>, txns: Arc<TransactionManager>) -> Self {
        Self { log, registry, txns }
    }

    pub fn recover(&self, tail: &LogTail) -> Result<RecoveryReport> {
        let files = self.log.file_manager().clone();
        let checkpoint = find_last_checkpoint(&files, &tail.end)?;

        let mut report = RecoveryReport {
            truncated_at: tail.truncated_at,
            ..RecoveryReport::default()
        };
        let mut counted_through = None;
        let start = match &checkpoint {
            Some((lsn, ckpt)) => {
                report.checkpoint_lsn = Some(*lsn);
                counted_through = self.restore_checkpoint(ckpt)?;
                ckpt.recovery_start()
            }
            None => {
                let first = files.list_files()?.first().copied().unwrap_or(0);
                Lsn::new(first, 0)
            }
        };
        report.recovery_start = start;
        info!("Recovery starting at {} (checkpoint {:?})", start, report.checkpoint_lsn);

        let logs = self.read_logs_from(&files, start)?;
        report.entries_scanned = logs.len() as u64;
        self.count_unsummarized(&logs, counted_through);

        let analysis = self.analysis_phase(&logs);
        self.registry.context().bump_node_id(analysis.max_node_id);
        self.registry.bump_db_id(analysis.max_db_id);
        self.txns.bump_txn_id(analysis.max_txn_id);
        report.txns_committed = analysis.committed.len();
        report.txns_aborted = analysis.aborted.len();

        report.nodes_redone = self.redo_nodes_phase(&logs)?;
        info!("Recovery redid {} nodes", report.nodes_redone);
        report.lns_redone = self.redo_phase(&logs, &analysis, counted_through, &mut report.deleted_keys)?;
        info!("Recovery redid {} records", report.lns_redone);

        let (undone, incomplete) = self.undo_phase(&analysis)?;
        report.lns_undone = undone;
        report.txns_incomplete = incomplete;
        info!(
            "Recovery undid {} records of {} incomplete and {} aborted transactions",
            undone, incomplete, report.txns_aborted
        );
        Ok(report)
    }

    /// Installs the roots and counters of the checkpoint. Returns where the
    /// restored file summaries stop counting.
    fn restore_checkpoint(&self, ckpt: &CkptEndEntry) -> Result<Option<Lsn>> {
        self.registry.context().bump_node_id(ckpt.last_node_id);
        self.registry.bump_db_id(ckpt.last_db_id);
        self.txns.bump_txn_id(ckpt.last_txn_id);
        for root in &ckpt.roots {
            self.registry.install(root);
        }

        let Some(summaries_lsn) = ckpt.summaries_lsn else {
            return Ok(None);
        };
        match self.log.read(summaries_lsn)? {
            LogEntry::FileSummaries(snapshot) => {
                let tracker = self.log.tracker();
                tracker.restore(snapshot.summaries);
                tracker.retain_files(&self.log.file_manager().list_files()?);
                Ok(Some(snapshot.end_of_log))
            }
            other => Err(LogTreeError::corruption(
                summaries_lsn,
                format!("expected file summaries, found a {:?} entry", other.entry_type()),
            )),
        }
    }

    fn read_logs_from(&self, files: &FileManager, start: Lsn) -> Result<Vec<LogItem>> {
        LogReader::new(files, start, None)?.collect()
    }

    /// Entries written after the last summary snapshot were never counted.
    fn count_unsummarized(&self, logs: &[LogItem], counted_through: Option<Lsn>) {
        if counted_through.is_none() {
            self.log.tracker().restore(Vec::new());
        }
        let tracker = self.log.tracker();
        for item in logs {
            if counted_through.map_or(true, |end| item.lsn >= end) {
                tracker.count_new(item.lsn, item.entry.entry_type(), item.size());
            }
        }
    }

    fn analysis_phase(&self, logs: &[LogItem]) -> Analysis {
        let mut analysis = Analysis::default();
        for item in logs {
            if let Some(txn) = item.entry.txn_id() {
                analysis.max_txn_id = analysis.max_txn_id.max(txn.0);
            }
            match &item.entry {
                LogEntry::Ln(ln) => {
                    if let Some(txn) = ln.txn {
                        analysis.last_lsn.insert(txn, item.lsn);
                    }
                }
                LogEntry::TxnCommit(end) => {
                    analysis.committed.insert(end.txn, item.lsn);
                }
                LogEntry::TxnAbort(end) => {
                    analysis.aborted.insert(end.txn, end.last_lsn);
                }
                LogEntry::In(node) => {
                    analysis.max_node_id = analysis.max_node_id.max(node.node_id.0);
                }
                LogEntry::InDelta(delta) => {
                    analysis.max_node_id = analysis.max_node_id.max(delta.node_id.0);
                }
                LogEntry::DbRoot(root) => {
                    analysis.max_db_id = analysis.max_db_id.max(root.db.0);
                    analysis.max_node_id = analysis.max_node_id.max(root.root_id.0);
                }
                _ => {}
            }
        }
        debug!(
            "Analysis found {} committed, {} aborted and {} writing transactions",
            analysis.committed.len(),
            analysis.aborted.len(),
            analysis.last_lsn.len()
        );
        analysis
    }

    /// Replays node images and root changes newer than what the tree holds.
    fn redo_nodes_phase(&self, logs: &[LogItem]) -> Result<u64> {
        let mut redone = 0;
        for item in logs {
            let applied = match &item.entry {
                LogEntry::In(node) => match self.registry.get(node.db) {
                    Some(tree) => tree.redo_node(node.node_id, node.level, &node.identifier_key, item.lsn)?,
                    None => false,
                },
                LogEntry::InDelta(delta) => match self.registry.get(delta.db) {
                    Some(tree) => tree.redo_node(delta.node_id, 1, &delta.identifier_key, item.lsn)?,
                    None => false,
                },
                LogEntry::DbRoot(root) => {
                    self.registry.install(root);
                    true
                }
                _ => false,
            };
            if applied {
                redone += 1;
            }
        }
        Ok(redone)
    }

    /// Replays record writes of committed and non-transactional writers.
    fn redo_phase(
        &self,
        logs: &[LogItem],
        analysis: &Analysis,
        counted_through: Option<Lsn>,
        deleted_keys: &mut Vec<(DatabaseID, Vec<u8>)>,
    ) -> Result<u64> {
        let tracker = self.log.tracker();
        let mut redone = 0;
        for item in logs {
            let LogEntry::Ln(ln) = &item.entry else {
                continue;
            };
            if ln.txn.map_or(false, |txn| !analysis.committed.contains_key(&txn)) {
                continue;
            }
            let Some(tree) = self.registry.get(ln.db) else {
                continue;
            };
            match tree.redo_ln(&ln.key, item.lsn, ln.data.as_deref())? {
                RedoOutcome::Inserted => redone += 1,
                RedoOutcome::Replaced(previous) => {
                    if !replacement_counted(ln, item.lsn, analysis, counted_through) {
                        tracker.count_obsolete(previous, EntryKind::Ln, None);
                    }
                    redone += 1;
                }
                RedoOutcome::Skipped => continue,
            }
            if ln.is_deletion() {
                deleted_keys.push((ln.db, ln.key.clone()));
            }
        }
        Ok(redone)
    }

    /// Rolls back every transaction that did not commit, newest first, and
    /// logs an abort for those that never finished.
    fn undo_phase(&self, analysis: &Analysis) -> Result<(u64, usize)> {
        let mut to_undo: Vec<(TransactionID, Lsn, bool)> = Vec::new();
        for (txn, last_lsn) in &analysis.last_lsn {
            if analysis.committed.contains_key(txn) {
                continue;
            }
            match analysis.aborted.get(txn) {
                Some(abort_last) => to_undo.push((*txn, abort_last.unwrap_or(*last_lsn), false)),
                None => to_undo.push((*txn, *last_lsn, true)),
            }
        }
        to_undo.sort_by(|a, b| b.1.cmp(&a.1));

        let tracker = self.log.tracker();
        let mut undone = 0;
        let mut incomplete = 0;
        for (txn, last_lsn, unfinished) in to_undo {
            let lsns = undo_chain(&self.log, &self.registry, Some(last_lsn))?;
            undone += lsns.len() as u64;
            if unfinished {
                tracker.count_obsolete_all(&lsns, EntryKind::Ln);
                self.log.append(
                    &LogEntry::TxnAbort(TxnEndEntry {
                        txn,
                        last_lsn: Some(last_lsn),
                        time_ms: now_ms(),
                    }),
                    FlushPolicy::None,
                )?;
                incomplete += 1;
                debug!("Rolled back incomplete {}", txn);
            }
        }
        Ok((undone, incomplete))
    }
}

/// Whether the restored summaries already count the version `ln` replaced.
/// A transactional write makes its predecessor obsolete when it commits,
/// any other write as soon as it is logged.
fn replacement_counted(ln: &LnEntry, lsn: Lsn, analysis: &Analysis, counted_through: Option<Lsn>) -> bool {
    let counted_at = match ln.txn {
        Some(txn) => analysis.committed.get(&txn).copied(),
        None => Some(lsn),
    };
    matches!((counted_at, counted_through), (Some(at), Some(end)) if at < end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::UtilizationTracker;
    use crate::common::EnvironmentConfig;
    use tempfile::TempDir;

    fn new_log(dir: &TempDir, env_id: Uuid) -> (Arc<FileManager>, LogManager) {
        let files = Arc::new(FileManager::open(dir.path()).unwrap());
        let log = LogManager::open(
            files.clone(),
            &EnvironmentConfig::without_daemons(),
            Arc::new(UtilizationTracker::new()),
            None,
            env_id,
        )
        .unwrap();
        (files, log)
    }

    #[test]
    fn test_summarized_replacements_are_not_recounted() {
        let ln = |txn: Option<u64>| LnEntry {
            db: DatabaseID(1),
            key: b"k".to_vec(),
            data: Some(b"v".to_vec()),
            txn: txn.map(TransactionID),
            prev_lsn: None,
            abort_lsn: None,
            abort_known_deleted: false,
        };
        let mut analysis = Analysis::default();
        analysis.committed.insert(TransactionID(1), Lsn::new(0, 300));
        analysis.committed.insert(TransactionID(2), Lsn::new(0, 900));
        let summarized = Some(Lsn::new(0, 500));

        assert!(replacement_counted(&ln(Some(1)), Lsn::new(0, 200), &analysis, summarized));
        // Logged before the snapshot but committed after it
        assert!(!replacement_counted(&ln(Some(2)), Lsn::new(0, 200), &analysis, summarized));
        assert!(replacement_counted(&ln(None), Lsn::new(0, 400), &analysis, summarized));
        assert!(!replacement_counted(&ln(None), Lsn::new(0, 600), &analysis, summarized));
        assert!(!replacement_counted(&ln(None), Lsn::new(0, 400), &analysis, None));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let env_id = Uuid::new_v4();
        let (files, log) = new_log(&dir, env_id);
        let first = log.append(&LogEntry::trace("first"), FlushPolicy::None).unwrap();
        let second = log.append(&LogEntry::trace("second"), FlushPolicy::Sync).unwrap();
        drop(log);

        let byte = files.read_at(0, second.offset + 20, 1).unwrap()[0];
        files.write_at(0, second.offset + 20, &[byte ^ 0xff]).unwrap();

        let tail = validate_tail(&files).unwrap().unwrap();
        assert_eq!(tail.env_id, env_id);
        assert_eq!(tail.truncated_at, Some(second));
        assert_eq!(tail.end.lsn(), second);
        assert_eq!(tail.end.last_entry_offset, Some(first.offset));
        assert_eq!(files.file_size(0).unwrap(), second.offset as u64);
    }

    #[test]
    fn test_headerless_last_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let (files, log) = new_log(&dir, Uuid::new_v4());
        let last = log.append(&LogEntry::trace("only"), FlushPolicy::Sync).unwrap();
        let end = log.end_of_log();
        drop(log);
        files.write_at(1, 0, &[0u8; 10]).unwrap();

        let tail = validate_tail(&files).unwrap().unwrap();
        assert_eq!(tail.truncated_at, Some(Lsn::new(1, 0)));
        assert_eq!(tail.end.lsn(), end);
        assert_eq!(tail.end.last_entry_offset, Some(last.offset));
        assert_eq!(files.list_files().unwrap(), vec![0]);
    }

    #[test]
    fn test_empty_directory_has_no_tail() {
        let dir = TempDir::new().unwrap();
        let files = FileManager::open(dir.path()).unwrap();
        assert!(validate_tail(&files).unwrap().is_none());
    }

    #[test]
    fn test_last_checkpoint_found_backward() {
        let dir = TempDir::new().unwrap();
        let (files, log) = new_log(&dir, Uuid::new_v4());
        let ckpt = CkptEndEntry {
            invoker: "test".to_string(),
            start_lsn: log.end_of_log(),
            first_active_lsn: None,
            last_node_id: 7,
            last_db_id: 2,
            last_txn_id: 11,
            roots: Vec::new(),
            summaries_lsn: None,
            time_ms: now_ms(),
        };
        let ckpt_lsn = log.append(&LogEntry::CkptEnd(ckpt), FlushPolicy::None).unwrap();
        for i in 0..5 {
            log.append(&LogEntry::trace(format!("after {}", i)), FlushPolicy::None).unwrap();
        }
        log.sync().unwrap();
        drop(log);

        let tail = validate_tail(&files).unwrap().unwrap();
        let (found, entry) = find_last_checkpoint(&files, &tail.end).unwrap().unwrap();
        assert_eq!(found, ckpt_lsn);
        assert_eq!(entry.last_txn_id, 11);
    }
}
