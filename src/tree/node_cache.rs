use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::node::NodeRef;
use crate::common::{DatabaseID, NodeID};

/// A resident node as the cache sees it.
#[derive(Clone)]
pub struct ResidentNode {
    pub id: NodeID,
    pub db: DatabaseID,
    pub level: u8,
    pub node: NodeRef,
}

struct CacheEntry {
    resident: ResidentNode,
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    nodes: HashMap<NodeID, CacheEntry>,
    // Access tick -> node, oldest first
    lru: BTreeMap<u64, NodeID>,
    next_tick: u64,
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    nodes_evicted: AtomicU64,
    lns_stripped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub resident_nodes: usize,
    pub memory_usage: u64,
    pub budget: u64,
    pub hits: u64,
    pub misses: u64,
    pub nodes_evicted: u64,
    pub lns_stripped: u64,
}

impl fmt::Display for CacheStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node Cache:")?;
        writeln!(f, "  Resident nodes: {}", self.resident_nodes)?;
        writeln!(f, "  Memory: {} / {} bytes", self.memory_usage, self.budget)?;
        writeln!(f, "  Hits: {}", self.hits)?;
        writeln!(f, "  Misses: {}", self.misses)?;
        writeln!(f, "  Nodes evicted: {}", self.nodes_evicted)?;
        writeln!(f, "  LNs stripped: {}", self.lns_stripped)
    }
}

/// Registry of every resident node across all databases, with an LRU order
/// and the memory budget they are charged against.
pub struct NodeCache {
    state: Mutex<CacheState>,
    memory_usage: AtomicI64,
    budget: u64,
    stats: CacheStats,
}

impl NodeCache {
    pub fn new(budget: u64) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            memory_usage: AtomicI64::new(0),
            budget,
            stats: CacheStats::default(),
        }
    }

    pub fn insert(&self, resident: ResidentNode, size: usize) {
        let mut state = self.state.lock();
        let tick = state.next_tick;
        state.next_tick += 1;
        let id = resident.id;
        if let Some(old) = state.nodes.insert(id, CacheEntry { resident, tick }) {
            state.lru.remove(&old.tick);
        } else {
            self.memory_usage.fetch_add(size as i64, Ordering::AcqRel);
        }
        state.lru.insert(tick, id);
    }

    /// Moves a node to the most recently used end.
    pub fn touch(&self, id: NodeID) {
        let mut state = self.state.lock();
        let tick = state.next_tick;
        let old_tick = match state.nodes.get_mut(&id) {
            Some(entry) => std::mem::replace(&mut entry.tick, tick),
            None => return,
        };
        state.next_tick += 1;
        state.lru.remove(&old_tick);
        state.lru.insert(tick, id);
    }

    pub fn remove(&self, id: NodeID, size: usize) {
        let mut state = self.state.lock();
        if let Some(entry) = state.nodes.remove(&id) {
            state.lru.remove(&entry.tick);
            self.memory_usage.fetch_sub(size as i64, Ordering::AcqRel);
        }
    }

    /// Charges a size change of a resident node.
    pub fn adjust(&self, delta: i64) {
        if delta != 0 {
            self.memory_usage.fetch_add(delta, Ordering::AcqRel);
        }
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Acquire).max(0) as u64
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn is_over_budget(&self) -> bool {
        self.memory_usage() > self.budget
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeID) -> bool {
        self.state.lock().nodes.contains_key(&id)
    }

    /// Up to `max` resident nodes, least recently used first.
    pub fn lru_candidates(&self, max: usize) -> Vec<ResidentNode> {
        let state = self.state.lock();
        state
            .lru
            .values()
            .take(max)
            .filter_map(|id| state.nodes.get(id).map(|entry| entry.resident.clone()))
            .collect()
    }

    pub fn resident_nodes(&self) -> Vec<ResidentNode> {
        self.state
            .lock()
            .nodes
            .values()
            .map(|entry| entry.resident.clone())
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.nodes.clear();
        state.lru.clear();
        self.memory_usage.store(0, Ordering::Release);
    }

    pub(crate) fn record_hit(&self) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        self.stats.nodes_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stripped(&self, count: usize) {
        self.stats.lns_stripped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            resident_nodes: self.len(),
            memory_usage: self.memory_usage(),
            budget: self.budget,
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            nodes_evicted: self.stats.nodes_evicted.load(Ordering::Relaxed),
            lns_stripped: self.stats.lns_stripped.load(Ordering::Relaxed),
        }
    }
}
