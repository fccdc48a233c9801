use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;

use crate::cleaner::Cleaner;
use crate::common::{BackgroundTask, EnvironmentConfig, Lsn, Result};
use crate::log_mod::{now_ms, CkptEndEntry, CkptStartEntry, FileSummariesEntry, FlushPolicy, LogEntry, LogManager};
use crate::transaction::TransactionManager;
use crate::tree::DatabaseRegistry;

struct CheckpointState {
    last_start: Option<Lsn>,
    last_end: Option<Lsn>,
    bytes_at_last: u64,
    time_of_last: Instant,
}

#[derive(Default)]
struct CheckpointerStats {
    checkpoints: AtomicU64,
    nodes_flushed: AtomicU64,
    files_deleted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointerStatsSnapshot {
    pub checkpoints: u64,
    pub nodes_flushed: u64,
    pub files_deleted: u64,
    pub last_start: Option<Lsn>,
    pub last_end: Option<Lsn>,
}

impl fmt::Display for CheckpointerStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Checkpointer:")?;
        writeln!(f, "  Checkpoints: {}", self.checkpoints)?;
        writeln!(f, "  Nodes flushed: {}", self.nodes_flushed)?;
        writeln!(f, "  Files deleted: {}", self.files_deleted)?;
        match (self.last_start, self.last_end) {
            (Some(start), Some(end)) => writeln!(f, "  Last checkpoint: {} .. {}", start, end),
            _ => writeln!(f, "  Last checkpoint: none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub nodes_flushed: u64,
    pub files_deleted: Vec<u32>,
}

/// Bounds recovery work by periodically writing every dirty node and a
/// checkpoint record that says where the next recovery may start.
pub struct Checkpointer {
    log: Arc<LogManager>,
    registry: Arc<DatabaseRegistry>,
    txns: Arc<TransactionManager>,
    cleaner: Arc<Cleaner>,
    bytes_interval: u64,
    time_interval: Duration,
    // Serializes checkpoints
    running: Mutex<()>,
    state: Mutex<CheckpointState>,
    stats: CheckpointerStats,
}

impl Checkpointer {
    pub fn new(
        log: Arc<LogManager>,
        registry: Arc<DatabaseRegistry>,
        txns: Arc<TransactionManager>,
        cleaner: Arc<Cleaner>,
        config: &EnvironmentConfig,
    ) -> Self {
        let bytes_at_last = log.bytes_logged();
        Self {
            log,
            registry,
            txns,
            cleaner,
            bytes_interval: config.checkpoint_bytes_interval,
            time_interval: config.checkpoint_interval,
            running: Mutex::new(()),
            state: Mutex::new(CheckpointState {
                last_start: None,
                last_end: None,
                bytes_at_last,
                time_of_last: Instant::now(),
            }),
            stats: CheckpointerStats::default(),
        }
    }

    /// Whether enough log was written or enough time passed since the last
    /// checkpoint. A zero interval disables that trigger.
    pub fn is_due(&self) -> bool {
        let state = self.state.lock();
        let bytes = self.log.bytes_logged().saturating_sub(state.bytes_at_last);
        (self.bytes_interval > 0 && bytes >= self.bytes_interval)
            || (!self.time_interval.is_zero() && state.time_of_last.elapsed() >= self.time_interval)
    }

    /// Runs a checkpoint if one is due, or unconditionally with `force`.
    pub fn checkpoint(&self, invoker: &str, force: bool) -> Result<Option<CheckpointReport>> {
        let _running = self.running.lock();
        if !force && !self.is_due() {
            return Ok(None);
        }

        let start_lsn = self.log.append(
            &LogEntry::CkptStart(CkptStartEntry {
                invoker: invoker.to_string(),
                time_ms: now_ms(),
            }),
            FlushPolicy::None,
        )?;
        let first_active_lsn = self.txns.first_active_lsn();

        let nodes_flushed = self.flush_dirty_nodes()?;

        let summaries_lsn = self.log.append(
            &LogEntry::FileSummaries(FileSummariesEntry {
                summaries: self.log.tracker().snapshot(),
                end_of_log: self.log.end_of_log(),
            }),
            FlushPolicy::None,
        )?;

        let end = CkptEndEntry {
            invoker: invoker.to_string(),
            start_lsn,
            first_active_lsn,
            last_node_id: self.registry.context().last_node_id(),
            last_db_id: self.registry.last_db_id(),
            last_txn_id: self.txns.last_txn_id(),
            roots: self.registry.root_infos(),
            summaries_lsn: Some(summaries_lsn),
            time_ms: now_ms(),
        };
        let recovery_start = end.recovery_start();
        let end_lsn = self.log.append(&LogEntry::CkptEnd(end), FlushPolicy::Sync)?;

        let files_deleted = self.cleaner.on_checkpoint_end(start_lsn, recovery_start)?;

        {
            let mut state = self.state.lock();
            state.last_start = Some(start_lsn);
            state.last_end = Some(end_lsn);
            state.bytes_at_last = self.log.bytes_logged();
            state.time_of_last = Instant::now();
        }
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.stats
            .nodes_flushed
            .fetch_add(nodes_flushed, Ordering::Relaxed);
        self.stats
            .files_deleted
            .fetch_add(files_deleted.len() as u64, Ordering::Relaxed);
        info!(
            "Checkpoint by {} at {}: {} nodes flushed, {} files deleted",
            invoker,
            end_lsn,
            nodes_flushed,
            files_deleted.len()
        );

        Ok(Some(CheckpointReport {
            start_lsn,
            end_lsn,
            nodes_flushed,
            files_deleted,
        }))
    }

    /// Logs dirty nodes one level at a time, BINs first, so every parent
    /// is written after the children whose new LSNs it records.
    fn flush_dirty_nodes(&self) -> Result<u64> {
        let cache = self.registry.context().cache().clone();
        let mut flushed = 0;
        let mut level = 1u8;
        loop {
            let resident = cache.resident_nodes();
            let top = resident.iter().map(|node| node.level).max().unwrap_or(0);
            if level > top {
                break;
            }

            let mut dirty: Vec<_> = resident
                .into_iter()
                .filter(|node| node.level == level)
                .filter_map(|node| {
                    let guard = node.node.read();
                    if !guard.dirty {
                        return None;
                    }
                    let identifier_key = guard.identifier_key.clone();
                    Some((node.db, node.id, identifier_key))
                })
                .collect();
            dirty.sort();

            for (db, node_id, identifier_key) in dirty {
                let Some(tree) = self.registry.get(db) else {
                    continue;
                };
                if tree.flush_node(node_id, level, &identifier_key, level == 1)?.is_some() {
                    flushed += 1;
                }
            }
            debug!("Checkpoint flushed level {}", level);
            level += 1;
        }
        Ok(flushed)
    }

    pub fn stats(&self) -> CheckpointerStatsSnapshot {
        let state = self.state.lock();
        CheckpointerStatsSnapshot {
            checkpoints: self.stats.checkpoints.load(Ordering::Relaxed),
            nodes_flushed: self.stats.nodes_flushed.load(Ordering::Relaxed),
            files_deleted: self.stats.files_deleted.load(Ordering::Relaxed),
            last_start: state.last_start,
            last_end: state.last_end,
        }
    }
}

impl BackgroundTask for Checkpointer {
    fn name(&self) -> &'static str {
        "checkpointer"
    }

    fn run_once(&self) -> Result<()> {
        self.checkpoint("daemon", false)?;
        Ok(())
    }
}
