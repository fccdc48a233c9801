use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::registry::DatabaseRegistry;
use crate::common::{BackgroundTask, DatabaseID, Result};
use crate::transaction::{LockManager, LockTarget};

#[derive(Default)]
struct CompressQueue {
    order: VecDeque<(DatabaseID, Vec<u8>)>,
    queued: HashSet<(DatabaseID, Vec<u8>)>,
}

#[derive(Default)]
struct CompressorStats {
    runs: AtomicU64,
    slots_removed: AtomicU64,
    bins_removed: AtomicU64,
    requeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressorStatsSnapshot {
    pub runs: u64,
    pub slots_removed: u64,
    pub bins_removed: u64,
    pub requeued: u64,
    pub pending: usize,
}

impl fmt::Display for CompressorStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compressor:")?;
        writeln!(f, "  Runs: {}", self.runs)?;
        writeln!(f, "  Slots removed: {}", self.slots_removed)?;
        writeln!(f, "  BINs removed: {}", self.bins_removed)?;
        writeln!(f, "  Requeued: {}", self.requeued)?;
        writeln!(f, "  Pending: {}", self.pending)
    }
}

/// Removes deleted slots, and the BINs they leave empty, for keys whose
/// deletion committed.
pub struct Compressor {
    registry: Arc<DatabaseRegistry>,
    locks: Arc<LockManager>,
    queue: Mutex<CompressQueue>,
    stats: CompressorStats,
}

impl Compressor {
    pub fn new(registry: Arc<DatabaseRegistry>, locks: Arc<LockManager>) -> Self {
        Self {
            registry,
            locks,
            queue: Mutex::new(CompressQueue::default()),
            stats: CompressorStats::default(),
        }
    }

    pub fn enqueue(&self, db: DatabaseID, key: Vec<u8>) {
        let mut queue = self.queue.lock();
        if queue.queued.insert((db, key.clone())) {
            queue.order.push_back((db, key));
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().order.len()
    }

    /// Processes everything queued so far. Keys that are still locked or in
    /// a pinned BIN go back on the queue for the next run.
    pub fn compress(&self) -> Result<usize> {
        let batch: Vec<_> = {
            let mut queue = self.queue.lock();
            queue.queued.clear();
            queue.order.drain(..).collect()
        };
        self.stats.runs.fetch_add(1, Ordering::Relaxed);

        let mut removed = 0;
        let mut retry = Vec::new();
        for (db, key) in batch {
            let Some(tree) = self.registry.get(db) else {
                continue;
            };
            let outcome = tree.compress(&key, |slot_key| self.locks.is_locked(&LockTarget::new(db, slot_key)))?;
            removed += outcome.slots_removed;
            self.stats
                .slots_removed
                .fetch_add(outcome.slots_removed as u64, Ordering::Relaxed);
            if outcome.bin_removed {
                self.stats.bins_removed.fetch_add(1, Ordering::Relaxed);
            }
            if outcome.retry {
                retry.push((db, key));
            }
        }

        if !retry.is_empty() {
            debug!("Compressor requeued {} keys", retry.len());
            self.stats
                .requeued
                .fetch_add(retry.len() as u64, Ordering::Relaxed);
            for (db, key) in retry {
                self.enqueue(db, key);
            }
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CompressorStatsSnapshot {
        CompressorStatsSnapshot {
            runs: self.stats.runs.load(Ordering::Relaxed),
            slots_removed: self.stats.slots_removed.load(Ordering::Relaxed),
            bins_removed: self.stats.bins_removed.load(Ordering::Relaxed),
            requeued: self.stats.requeued.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }
}

impl BackgroundTask for Compressor {
    fn name(&self) -> &'static str {
        "compressor"
    }

    fn run_once(&self) -> Result<()> {
        if self.pending() > 0 {
            self.compress()?;
        }
        Ok(())
    }
}
