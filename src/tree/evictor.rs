use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use super::node_cache::NodeCache;
use super::registry::DatabaseRegistry;
use crate::common::{BackgroundTask, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictReport {
    pub lns_stripped: usize,
    pub nodes_evicted: usize,
    pub memory_before: u64,
    pub memory_after: u64,
}

#[derive(Default)]
struct EvictorStats {
    runs: AtomicU64,
    lns_stripped: AtomicU64,
    nodes_evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictorStatsSnapshot {
    pub runs: u64,
    pub lns_stripped: u64,
    pub nodes_evicted: u64,
}

impl fmt::Display for EvictorStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Evictor:")?;
        writeln!(f, "  Runs: {}", self.runs)?;
        writeln!(f, "  LNs stripped: {}", self.lns_stripped)?;
        writeln!(f, "  Nodes evicted: {}", self.nodes_evicted)
    }
}

/// Keeps the node cache under its budget. Record data is dropped from BINs
/// before whole nodes are evicted.
pub struct Evictor {
    registry: Arc<DatabaseRegistry>,
    cache: Arc<NodeCache>,
    stats: EvictorStats,
}

impl Evictor {
    pub fn new(registry: Arc<DatabaseRegistry>, cache: Arc<NodeCache>) -> Self {
        Self {
            registry,
            cache,
            stats: EvictorStats::default(),
        }
    }

    /// Runs until the cache is under budget or nothing more can go.
    pub fn evict(&self) -> Result<EvictReport> {
        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        let mut report = EvictReport {
            memory_before: self.cache.memory_usage(),
            ..EvictReport::default()
        };

        if self.cache.is_over_budget() {
            for resident in self.cache.lru_candidates(usize::MAX) {
                if !self.cache.is_over_budget() {
                    break;
                }
                if resident.level != 1 {
                    continue;
                }
                if let Some(tree) = self.registry.get(resident.db) {
                    report.lns_stripped += tree.strip_bin(&resident.node);
                }
            }
        }

        while self.cache.is_over_budget() {
            let mut progress = false;
            for resident in self.cache.lru_candidates(self.cache.len()) {
                if !self.cache.is_over_budget() {
                    break;
                }
                let Some(tree) = self.registry.get(resident.db) else {
                    continue;
                };
                if tree.evict_node(&resident.node)? {
                    report.nodes_evicted += 1;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        report.memory_after = self.cache.memory_usage();
        self.stats
            .lns_stripped
            .fetch_add(report.lns_stripped as u64, Ordering::Relaxed);
        self.stats
            .nodes_evicted
            .fetch_add(report.nodes_evicted as u64, Ordering::Relaxed);
        if report.lns_stripped > 0 || report.nodes_evicted > 0 {
            debug!(
                "Evicted {} nodes and stripped {} LNs, cache {} -> {} bytes",
                report.nodes_evicted, report.lns_stripped, report.memory_before, report.memory_after
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> EvictorStatsSnapshot {
        EvictorStatsSnapshot {
            runs: self.stats.runs.load(Ordering::Relaxed),
            lns_stripped: self.stats.lns_stripped.load(Ordering::Relaxed),
            nodes_evicted: self.stats.nodes_evicted.load(Ordering::Relaxed),
        }
    }
}

impl BackgroundTask for Evictor {
    fn name(&self) -> &'static str {
        "evictor"
    }

    fn run_once(&self) -> Result<()> {
        if self.cache.is_over_budget() {
            self.evict()?;
        }
        Ok(())
    }
}
