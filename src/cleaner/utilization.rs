use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::Lsn;
use crate::log_mod::LogEntryType;

/// What an entry counts as for utilization purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Ln,
    Node,
    Other,
}

impl From<LogEntryType> for EntryKind {
    fn from(entry_type: LogEntryType) -> Self {
        if entry_type.is_ln() {
            EntryKind::Ln
        } else if entry_type.is_node() {
            EntryKind::Node
        } else {
            EntryKind::Other
        }
    }
}

/// Per-file counts of everything written and everything known obsolete.
/// Obsolete bytes are exact when the caller knew the entry size and
/// otherwise estimated from the average entry size of that kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub total_count: u32,
    pub total_size: u64,
    pub ln_count: u32,
    pub ln_size: u64,
    pub in_count: u32,
    pub in_size: u64,
    pub obsolete_ln_count: u32,
    pub obsolete_in_count: u32,
    pub obsolete_other_count: u32,
    pub obsolete_exact_size: u64,
    pub obsolete_ln_unsized: u32,
    pub obsolete_in_unsized: u32,
}

impl FileSummary {
    fn average(size: u64, count: u32) -> u64 {
        if count == 0 {
            0
        } else {
            size / count as u64
        }
    }

    pub fn obsolete_size(&self) -> u64 {
        let estimated = self.obsolete_exact_size
            + self.obsolete_ln_unsized as u64 * Self::average(self.ln_size, self.ln_count)
            + self.obsolete_in_unsized as u64 * Self::average(self.in_size, self.in_count);
        estimated.min(self.total_size)
    }

    pub fn live_size(&self) -> u64 {
        self.total_size - self.obsolete_size()
    }

    /// Live bytes as a percentage of total bytes.
    pub fn utilization(&self) -> u32 {
        if self.total_size == 0 {
            return 100;
        }
        (self.live_size() * 100 / self.total_size) as u32
    }

    fn add_new(&mut self, kind: EntryKind, size: u32) {
        self.total_count += 1;
        self.total_size += size as u64;
        match kind {
            EntryKind::Ln => {
                self.ln_count += 1;
                self.ln_size += size as u64;
            }
            EntryKind::Node => {
                self.in_count += 1;
                self.in_size += size as u64;
            }
            EntryKind::Other => {
                self.obsolete_other_count += 1;
                self.obsolete_exact_size += size as u64;
            }
        }
    }

    fn add_obsolete(&mut self, kind: EntryKind, size: Option<u32>) {
        match kind {
            EntryKind::Ln => self.obsolete_ln_count += 1,
            EntryKind::Node => self.obsolete_in_count += 1,
            EntryKind::Other => self.obsolete_other_count += 1,
        }
        match (kind, size) {
            (_, Some(size)) => self.obsolete_exact_size += size as u64,
            (EntryKind::Ln, None) => self.obsolete_ln_unsized += 1,
            (EntryKind::Node, None) => self.obsolete_in_unsized += 1,
            (EntryKind::Other, None) => {}
        }
    }
}

/// Tracks a `FileSummary` for every log file. Updated by the log manager as
/// entries are written and by the tree, transactions and cleaner as entries
/// become obsolete.
#[derive(Debug, Default)]
pub struct UtilizationTracker {
    summaries: Mutex<BTreeMap<u32, FileSummary>>,
}

impl UtilizationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_new(&self, lsn: Lsn, entry_type: LogEntryType, size: u32) {
        self.summaries
            .lock()
            .entry(lsn.file)
            .or_default()
            .add_new(entry_type.into(), size);
    }

    pub fn count_obsolete(&self, lsn: Lsn, kind: EntryKind, size: Option<u32>) {
        let mut summaries = self.summaries.lock();
        // A file that was already deleted has nothing left to count
        if let Some(summary) = summaries.get_mut(&lsn.file) {
            summary.add_obsolete(kind, size);
        }
    }

    pub fn count_obsolete_all(&self, lsns: &[Lsn], kind: EntryKind) {
        let mut summaries = self.summaries.lock();
        for lsn in lsns {
            if let Some(summary) = summaries.get_mut(&lsn.file) {
                summary.add_obsolete(kind, None);
            }
        }
    }

    pub fn summary(&self, file: u32) -> Option<FileSummary> {
        self.summaries.lock().get(&file).cloned()
    }

    pub fn snapshot(&self) -> Vec<(u32, FileSummary)> {
        self.summaries
            .lock()
            .iter()
            .map(|(file, summary)| (*file, summary.clone()))
            .collect()
    }

    /// Replaces the summaries with a logged snapshot.
    pub fn restore(&self, snapshot: Vec<(u32, FileSummary)>) {
        let mut summaries = self.summaries.lock();
        summaries.clear();
        summaries.extend(snapshot);
    }

    /// Drops summaries of files that no longer exist.
    pub fn retain_files(&self, existing: &[u32]) {
        self.summaries
            .lock()
            .retain(|file, _| existing.binary_search(file).is_ok());
    }

    pub fn remove_file(&self, file: u32) {
        self.summaries.lock().remove(&file);
    }

    /// Overall utilization across all files, in percent.
    pub fn total_utilization(&self) -> u32 {
        let summaries = self.summaries.lock();
        let total: u64 = summaries.values().map(|s| s.total_size).sum();
        if total == 0 {
            return 100;
        }
        let live: u64 = summaries.values().map(|s| s.live_size()).sum();
        (live * 100 / total) as u32
    }
}
