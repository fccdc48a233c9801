use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::file_selector::{select_files, SelectionParams};
use crate::common::{BackgroundTask, EnvironmentConfig, Lsn, Result};
use crate::log_mod::{LogEntry, LogManager, LogReader};
use crate::transaction::{LockManager, LockTarget};
use crate::tree::{DatabaseRegistry, MigrateOutcome};

#[derive(Debug, Default)]
struct CleanerState {
    // Files with write-locked records, retried on the next run
    pending: BTreeSet<u32>,
    // Fully cleaned files and the end of log when they were finished
    cleaned: BTreeMap<u32, Lsn>,
    recovery_start: Option<Lsn>,
    protected_file: Option<u32>,
}

#[derive(Default)]
struct CleanerStats {
    runs: AtomicU64,
    files_cleaned: AtomicU64,
    files_deleted: AtomicU64,
    lns_migrated: AtomicU64,
    ins_migrated: AtomicU64,
    entries_obsolete: AtomicU64,
    lns_locked: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanerStatsSnapshot {
    pub runs: u64,
    pub files_cleaned: u64,
    pub files_deleted: u64,
    pub lns_migrated: u64,
    pub ins_migrated: u64,
    pub entries_obsolete: u64,
    pub lns_locked: u64,
    pub backlog: usize,
    pub awaiting_deletion: usize,
}

impl fmt::Display for CleanerStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cleaner:")?;
        writeln!(f, "  Runs: {}", self.runs)?;
        writeln!(f, "  Files cleaned: {}", self.files_cleaned)?;
        writeln!(f, "  Files deleted: {}", self.files_deleted)?;
        writeln!(f, "  LNs migrated: {}", self.lns_migrated)?;
        writeln!(f, "  INs migrated: {}", self.ins_migrated)?;
        writeln!(f, "  Entries obsolete: {}", self.entries_obsolete)?;
        writeln!(f, "  LNs locked: {}", self.lns_locked)?;
        writeln!(f, "  Backlog: {}", self.backlog)?;
        writeln!(f, "  Awaiting deletion: {}", self.awaiting_deletion)
    }
}

/// Result of one cleaner run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub files_cleaned: Vec<u32>,
    pub files_pending: Vec<u32>,
    pub lns_migrated: u64,
    pub ins_migrated: u64,
    pub entries_obsolete: u64,
}

#[derive(Debug, Default)]
struct FileOutcome {
    lns_migrated: u64,
    ins_migrated: u64,
    obsolete: u64,
    locked: u64,
}

/// Reclaims log space. Live entries of poorly utilized files are moved to
/// the head of the log; the files are deleted once a later checkpoint has
/// made the moved entries reachable.
pub struct Cleaner {
    log: Arc<LogManager>,
    registry: Arc<DatabaseRegistry>,
    locks: Arc<LockManager>,
    min_utilization: u32,
    min_file_utilization: u32,
    backlog: usize,
    state: Mutex<CleanerState>,
    stats: CleanerStats,
}

impl Cleaner {
    pub fn new(
        log: Arc<LogManager>,
        registry: Arc<DatabaseRegistry>,
        locks: Arc<LockManager>,
        config: &EnvironmentConfig,
    ) -> Self {
        Self {
            log,
            registry,
            locks,
            min_utilization: config.cleaner_min_utilization,
            min_file_utilization: config.cleaner_min_file_utilization,
            backlog: config.cleaner_backlog,
            state: Mutex::new(CleanerState::default()),
            stats: CleanerStats::default(),
        }
    }

    /// Files at or after this LSN are needed by recovery and never cleaned.
    pub fn set_recovery_start(&self, lsn: Lsn) {
        let mut state = self.state.lock();
        if state.recovery_start.map_or(true, |current| lsn > current) {
            state.recovery_start = Some(lsn);
        }
    }

    /// Files at or after `file` are neither cleaned nor deleted.
    pub fn set_protected_file(&self, file: Option<u32>) {
        self.state.lock().protected_file = file;
    }

    pub fn protected_file(&self) -> Option<u32> {
        self.state.lock().protected_file
    }

    fn upper_bound(&self, state: &CleanerState) -> u32 {
        let Some(recovery_start) = state.recovery_start else {
            return 0;
        };
        let mut bound = recovery_start.file.min(self.log.current_file());
        if let Some(protected) = state.protected_file {
            bound = bound.min(protected);
        }
        bound
    }

    /// Files the next run would pick up, pending files first.
    pub fn select(&self) -> Vec<u32> {
        let state = self.state.lock();
        let upper_bound = self.upper_bound(&state);
        let mut files: Vec<u32> = state
            .pending
            .iter()
            .copied()
            .filter(|file| *file < upper_bound)
            .collect();
        if files.len() >= self.backlog {
            files.truncate(self.backlog);
            return files;
        }

        let skip: BTreeSet<u32> = state
            .pending
            .iter()
            .chain(state.cleaned.keys())
            .copied()
            .collect();
        let params = SelectionParams {
            min_utilization: self.min_utilization,
            min_file_utilization: self.min_file_utilization,
            max_files: self.backlog - files.len(),
            upper_bound,
        };
        files.extend(select_files(&self.log.tracker().snapshot(), &skip, &params));
        files
    }

    /// Cleans the selected files.
    pub fn clean(&self) -> Result<CleanReport> {
        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        let mut report = CleanReport::default();

        for file in self.select() {
            let outcome = self.process_file(file)?;
            report.lns_migrated += outcome.lns_migrated;
            report.ins_migrated += outcome.ins_migrated;
            report.entries_obsolete += outcome.obsolete;

            let mut state = self.state.lock();
            if outcome.locked > 0 {
                warn!("Log file {} has {} locked records, will retry", file, outcome.locked);
                state.pending.insert(file);
                report.files_pending.push(file);
            } else {
                state.pending.remove(&file);
                state.cleaned.insert(file, self.log.end_of_log());
                self.stats.files_cleaned.fetch_add(1, Ordering::Relaxed);
                report.files_cleaned.push(file);
            }
        }

        if !report.files_cleaned.is_empty() || !report.files_pending.is_empty() {
            info!(
                "Cleaner run: {} files cleaned, {} pending, {} LNs and {} INs migrated",
                report.files_cleaned.len(),
                report.files_pending.len(),
                report.lns_migrated,
                report.ins_migrated
            );
        }
        Ok(report)
    }

    fn process_file(&self, file: u32) -> Result<FileOutcome> {
        let mut outcome = FileOutcome::default();
        for item in LogReader::for_file(self.log.file_manager(), file)? {
            let item = item?;
            match item.entry {
                LogEntry::Ln(entry) => {
                    let Some(tree) = self.registry.get(entry.db) else {
                        outcome.obsolete += 1;
                        continue;
                    };
                    let target = LockTarget::new(entry.db, &entry.key);
                    let migrated =
                        tree.migrate_ln(&entry.key, item.lsn, &entry, || self.locks.is_write_locked(&target))?;
                    match migrated {
                        MigrateOutcome::Migrated(_) => outcome.lns_migrated += 1,
                        MigrateOutcome::Obsolete => outcome.obsolete += 1,
                        MigrateOutcome::Locked => outcome.locked += 1,
                    }
                }
                LogEntry::In(entry) => {
                    let live = match self.registry.get(entry.db) {
                        Some(tree) => tree.migrate_node(entry.node_id, entry.level, &entry.identifier_key, item.lsn)?,
                        None => false,
                    };
                    if live {
                        outcome.ins_migrated += 1;
                    } else {
                        outcome.obsolete += 1;
                    }
                }
                LogEntry::InDelta(entry) => {
                    let live = match self.registry.get(entry.db) {
                        Some(tree) => tree.migrate_node(entry.node_id, 1, &entry.identifier_key, item.lsn)?,
                        None => false,
                    };
                    if live {
                        outcome.ins_migrated += 1;
                    } else {
                        outcome.obsolete += 1;
                    }
                }
                // Anything else is only read by recovery, which starts later
                _ => outcome.obsolete += 1,
            }
        }

        debug!(
            "Processed log file {}: {} LNs migrated, {} INs migrated, {} obsolete, {} locked",
            file, outcome.lns_migrated, outcome.ins_migrated, outcome.obsolete, outcome.locked
        );
        self.stats
            .lns_migrated
            .fetch_add(outcome.lns_migrated, Ordering::Relaxed);
        self.stats
            .ins_migrated
            .fetch_add(outcome.ins_migrated, Ordering::Relaxed);
        self.stats
            .entries_obsolete
            .fetch_add(outcome.obsolete, Ordering::Relaxed);
        self.stats.lns_locked.fetch_add(outcome.locked, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Called once a checkpoint that started at `ckpt_start` is durable.
    /// Deletes every file cleaned before that checkpoint began.
    pub fn on_checkpoint_end(&self, ckpt_start: Lsn, recovery_start: Lsn) -> Result<Vec<u32>> {
        let deletable: Vec<u32> = {
            let mut state = self.state.lock();
            if state.recovery_start.map_or(true, |current| recovery_start > current) {
                state.recovery_start = Some(recovery_start);
            }
            let protected = state.protected_file.unwrap_or(u32::MAX);
            state
                .cleaned
                .iter()
                .filter(|(file, cleaned_at)| **cleaned_at <= ckpt_start && **file < protected)
                .map(|(file, _)| *file)
                .collect()
        };

        let files = self.log.file_manager();
        let tracker = self.log.tracker();
        for file in &deletable {
            files.delete_file(*file)?;
            tracker.remove_file(*file);
            self.state.lock().cleaned.remove(file);
            self.stats.files_deleted.fetch_add(1, Ordering::Relaxed);
            info!("Deleted cleaned log file {}", file);
        }
        Ok(deletable)
    }

    pub fn stats(&self) -> CleanerStatsSnapshot {
        let state = self.state.lock();
        CleanerStatsSnapshot {
            runs: self.stats.runs.load(Ordering::Relaxed),
            files_cleaned: self.stats.files_cleaned.load(Ordering::Relaxed),
            files_deleted: self.stats.files_deleted.load(Ordering::Relaxed),
            lns_migrated: self.stats.lns_migrated.load(Ordering::Relaxed),
            ins_migrated: self.stats.ins_migrated.load(Ordering::Relaxed),
            entries_obsolete: self.stats.entries_obsolete.load(Ordering::Relaxed),
            lns_locked: self.stats.lns_locked.load(Ordering::Relaxed),
            backlog: state.pending.len(),
            awaiting_deletion: state.cleaned.len(),
        }
    }
}

impl BackgroundTask for Cleaner {
    fn name(&self) -> &'static str {
        "cleaner"
    }

    fn run_once(&self) -> Result<()> {
        self.clean()?;
        Ok(())
    }
}
