use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{RwLock, RwLockWriteGuard};

use super::node::{ChildEntry, ChildRef, LeafSlot, Node, NodeReadGuard, NodeRef, NodeWriteGuard};
use super::node_cache::{NodeCache, ResidentNode};
use crate::cleaner::{EntryKind, UtilizationTracker};
use crate::common::{DatabaseID, EnvironmentConfig, LogTreeError, Lsn, NodeID, Result};
use crate::log_mod::{DbRootInfo, FlushPolicy, LnEntry, LogEntry, LogManager};

#[derive(Default)]
struct TreeStats {
    splits: AtomicU64,
    root_splits: AtomicU64,
    nodes_logged: AtomicU64,
    deltas_logged: AtomicU64,
    slots_compressed: AtomicU64,
    bins_removed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStatsSnapshot {
    pub splits: u64,
    pub root_splits: u64,
    pub nodes_logged: u64,
    pub deltas_logged: u64,
    pub slots_compressed: u64,
    pub bins_removed: u64,
}

impl fmt::Display for TreeStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tree:")?;
        writeln!(f, "  Splits: {} ({} root)", self.splits, self.root_splits)?;
        writeln!(f, "  Nodes logged: {} ({} deltas)", self.nodes_logged, self.deltas_logged)?;
        writeln!(f, "  Slots compressed: {}", self.slots_compressed)?;
        writeln!(f, "  BINs removed: {}", self.bins_removed)
    }
}

/// Services shared by every tree of an environment.
pub struct TreeContext {
    log: Arc<LogManager>,
    cache: Arc<NodeCache>,
    tracker: Arc<UtilizationTracker>,
    last_node_id: AtomicU64,
    max_entries: usize,
    delta_percent: u32,
    stats: TreeStats,
}

impl TreeContext {
    pub fn new(log: Arc<LogManager>, cache: Arc<NodeCache>, config: &EnvironmentConfig, last_node_id: u64) -> Self {
        let tracker = log.tracker().clone();
        Self {
            log,
            cache,
            tracker,
            last_node_id: AtomicU64::new(last_node_id),
            max_entries: config.node_max_entries,
            delta_percent: config.delta_percent,
            stats: TreeStats::default(),
        }
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    pub fn allocate_node_id(&self) -> NodeID {
        NodeID(self.last_node_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn last_node_id(&self) -> u64 {
        self.last_node_id.load(Ordering::Acquire)
    }

    /// Makes sure ids handed out later are above `seen`.
    pub fn bump_node_id(&self, seen: u64) {
        self.last_node_id.fetch_max(seen, Ordering::AcqRel);
    }

    pub fn stats(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            splits: self.stats.splits.load(Ordering::Relaxed),
            root_splits: self.stats.root_splits.load(Ordering::Relaxed),
            nodes_logged: self.stats.nodes_logged.load(Ordering::Relaxed),
            deltas_logged: self.stats.deltas_logged.load(Ordering::Relaxed),
            slots_compressed: self.stats.slots_compressed.load(Ordering::Relaxed),
            bins_removed: self.stats.bins_removed.load(Ordering::Relaxed),
        }
    }
}

/// State of a slot before a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    pub lsn: Lsn,
    pub known_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub lsn: Lsn,
    pub known_deleted: bool,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub lsn: Lsn,
    pub previous: Option<SlotState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoOutcome {
    Inserted,
    Replaced(Lsn),
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    Migrated(Lsn),
    Obsolete,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressOutcome {
    pub slots_removed: usize,
    pub bin_removed: bool,
    /// Something was left behind and the key should be queued again
    pub retry: bool,
}

/// Where the parent search for a node ended.
pub enum ParentSearch<'a> {
    /// The node is the root; the root latch is held exclusively.
    Root(RwLockWriteGuard<'a, ChildRef>),
    Found { parent: NodeWriteGuard, index: usize },
    NotFound,
}

/// A snapshot of the live slots of one BIN, taken for a cursor.
pub struct BinSnapshot {
    pub node: NodeRef,
    pub slots: Vec<LeafSlot>,
    /// Lowest key of the next BIN, if there is one
    pub upper_bound: Option<Vec<u8>>,
}

struct SharedDescent {
    node: NodeRef,
    guard: NodeReadGuard,
    upper_bound: Option<Vec<u8>>,
}

enum BinParent {
    RootBin(NodeWriteGuard),
    Parent(NodeWriteGuard),
}

/// B-tree of one database. Nodes are latched top-down: shared coupling for
/// reads, exclusive coupling with preemptive splits for writes. The root
/// latch guards the root reference and is always taken before any node.
pub struct Tree {
    db: DatabaseID,
    name: String,
    root: RwLock<ChildRef>,
    ctx: Arc<TreeContext>,
}

impl Tree {
    /// Creates an empty tree: one empty root BIN, logged.
    pub fn create(ctx: Arc<TreeContext>, db: DatabaseID, name: &str) -> Result<Self> {
        let root_id = ctx.allocate_node_id();
        let tree = Self {
            db,
            name: name.to_string(),
            root: RwLock::new(ChildRef::new(root_id, Lsn::default(), None)),
            ctx,
        };

        let node: NodeRef = Arc::new(RwLock::new(Node::new_bin(root_id, db, Vec::new(), Vec::new())));
        let lsn = {
            let mut guard = node.write();
            tree.log_node(&mut guard, false)?
        };
        tree.register(&node);
        *tree.root.write() = ChildRef::new(root_id, lsn, Some(node));
        Ok(tree)
    }

    /// Opens a tree whose root is known from the log. Nothing is loaded
    /// until first access.
    pub fn open(ctx: Arc<TreeContext>, info: &DbRootInfo) -> Self {
        Self {
            db: info.db,
            name: info.name.clone(),
            root: RwLock::new(ChildRef::new(info.root_id, info.root_lsn, None)),
            ctx,
        }
    }

    pub fn db(&self) -> DatabaseID {
        self.db
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<TreeContext> {
        &self.ctx
    }

    pub fn root_info(&self) -> DbRootInfo {
        let root = self.root.read();
        DbRootInfo {
            db: self.db,
            name: self.name.clone(),
            root_id: root.node_id,
            root_lsn: root.lsn,
        }
    }

    pub fn height(&self) -> Result<u8> {
        let root = self.root.read();
        let node = self.fetch(&root)?;
        let level = node.read().level;
        Ok(level)
    }

    fn register(&self, node: &NodeRef) {
        let guard = node.read();
        self.ctx.cache.insert(
            ResidentNode {
                id: guard.id,
                db: guard.db,
                level: guard.level,
                node: node.clone(),
            },
            guard.memory_size(),
        );
    }

    fn charge(&self, node: &mut Node) {
        let delta = node.refresh_memory_size();
        self.ctx.cache.adjust(delta);
    }

    /// Returns the node `target` refers to, loading it from the log if it
    /// is not resident.
    fn fetch(&self, target: &ChildRef) -> Result<NodeRef> {
        let (node, loaded) = target.get_or_load(|id, lsn| self.load_node(id, lsn))?;
        if loaded {
            self.ctx.cache.record_miss();
            self.register(&node);
        } else {
            self.ctx.cache.record_hit();
            self.ctx.cache.touch(target.node_id);
        }
        Ok(node)
    }

    fn load_node(&self, id: NodeID, lsn: Lsn) -> Result<NodeRef> {
        let node = match self.ctx.log.read(lsn)? {
            LogEntry::In(image) => Node::from_in_entry(&image, lsn),
            LogEntry::InDelta(delta) => {
                let base = match self.ctx.log.read(delta.base_lsn)? {
                    LogEntry::In(image) => image,
                    other => {
                        return Err(LogTreeError::corruption(
                            delta.base_lsn,
                            format!("delta base is a {:?} entry", other.entry_type()),
                        ))
                    }
                };
                let mut node = Node::from_in_entry(&base, delta.base_lsn);
                node.apply_delta(&delta, lsn);
                node
            }
            other => {
                return Err(LogTreeError::corruption(
                    lsn,
                    format!("expected {} but found a {:?} entry", id, other.entry_type()),
                ))
            }
        };
        if node.id != id {
            return Err(LogTreeError::corruption(
                lsn,
                format!("expected {} but found {}", id, node.id),
            ));
        }
        Ok(Arc::new(RwLock::new(node)))
    }

    /// Logs the node as a full image, or as a delta when allowed and few
    /// slots changed. The previous images become obsolete.
    fn log_node(&self, node: &mut Node, allow_delta: bool) -> Result<Lsn> {
        let tracker = &self.ctx.tracker;
        let lsn = if allow_delta && node.can_log_delta(self.ctx.delta_percent) {
            let base = node.last_full_lsn.unwrap_or_default();
            let lsn = self
                .ctx
                .log
                .append(&LogEntry::InDelta(node.to_delta(base)), FlushPolicy::None)?;
            if let Some(previous) = node.last_delta_lsn {
                tracker.count_obsolete(previous, EntryKind::Node, None);
            }
            node.last_delta_lsn = Some(lsn);
            // Slots stay dirty until the next full image so every delta
            // carries all changes since that image
            node.dirty = false;
            self.ctx.stats.deltas_logged.fetch_add(1, Ordering::Relaxed);
            lsn
        } else {
            let lsn = self
                .ctx
                .log
                .append(&LogEntry::In(node.to_in_entry()), FlushPolicy::None)?;
            for previous in [node.last_full_lsn, node.last_delta_lsn].into_iter().flatten() {
                tracker.count_obsolete(previous, EntryKind::Node, None);
            }
            node.last_full_lsn = Some(lsn);
            node.last_delta_lsn = None;
            node.prohibit_delta = false;
            node.mark_clean();
            lsn
        };
        self.ctx.stats.nodes_logged.fetch_add(1, Ordering::Relaxed);
        Ok(lsn)
    }

    fn log_root(&self, root_id: NodeID, root_lsn: Lsn) -> Result<Lsn> {
        let info = DbRootInfo {
            db: self.db,
            name: self.name.clone(),
            root_id,
            root_lsn,
        };
        self.ctx.log.append(&LogEntry::DbRoot(info), FlushPolicy::None)
    }

    fn descend_shared(&self, key: &[u8]) -> Result<SharedDescent> {
        let root = self.root.read();
        let mut node = self.fetch(&root)?;
        let mut guard = node.read_arc();
        drop(root);

        let mut upper_bound = None;
        while !guard.is_bin() {
            let index = guard.child_index(key);
            if let Some(next) = guard.children().get(index + 1) {
                upper_bound = Some(next.key.clone());
            }
            let child = self.fetch(&guard.children()[index].target)?;
            let child_guard = child.read_arc();
            node = child;
            guard = child_guard;
        }
        Ok(SharedDescent {
            node,
            guard,
            upper_bound,
        })
    }

    /// Latches the BIN covering `key` exclusively, coupling shared latches
    /// above it. Never splits.
    fn latch_bin_exclusive(&self, key: &[u8]) -> Result<NodeWriteGuard> {
        let root = self.root.read();
        let node = self.fetch(&root)?;
        if node.read().is_bin() {
            return Ok(node.write_arc());
        }
        let mut guard = node.read_arc();
        drop(root);

        loop {
            let index = guard.child_index(key);
            let child = self.fetch(&guard.children()[index].target)?;
            if guard.level == 2 {
                return Ok(child.write_arc());
            }
            guard = child.read_arc();
        }
    }

    /// Latches the parent of the BIN covering `key` exclusively, or the root
    /// BIN itself when the tree has a single level.
    fn latch_bin_parent(&self, key: &[u8]) -> Result<BinParent> {
        let root = self.root.read();
        let node = self.fetch(&root)?;
        let level = node.read().level;
        if level == 1 {
            return Ok(BinParent::RootBin(node.write_arc()));
        }
        if level == 2 {
            return Ok(BinParent::Parent(node.write_arc()));
        }
        let mut guard = node.read_arc();
        drop(root);

        loop {
            let index = guard.child_index(key);
            let child = self.fetch(&guard.children()[index].target)?;
            if guard.level == 3 {
                return Ok(BinParent::Parent(child.write_arc()));
            }
            guard = child.read_arc();
        }
    }

    /// Exclusive descent to the BIN for `key`. Every full node on the way is
    /// split before it is entered, so the returned BIN has room for one more
    /// slot.
    fn descend_for_write(&self, key: &[u8]) -> Result<NodeWriteGuard> {
        'restart: loop {
            let root = self.root.read();
            let root_node = self.fetch(&root)?;
            let mut guard = root_node.write_arc();
            if guard.is_full(self.ctx.max_entries) {
                drop(guard);
                drop(root);
                self.split_root()?;
                continue 'restart;
            }
            drop(root);

            loop {
                if guard.is_bin() {
                    return Ok(guard);
                }
                let index = guard.child_index(key);
                let child = self.fetch(&guard.children()[index].target)?;
                let child_guard = child.write_arc();
                if child_guard.is_full(self.ctx.max_entries) {
                    self.split_child(&mut guard, index, child_guard)?;
                    continue;
                }
                guard = child_guard;
            }
        }
    }

    fn split_child(&self, parent: &mut Node, index: usize, mut child: NodeWriteGuard) -> Result<()> {
        let new_id = self.ctx.allocate_node_id();
        let (separator, sibling) = child.split(new_id);
        let sibling: NodeRef = Arc::new(RwLock::new(sibling));

        let left_lsn = self.log_node(&mut child, false)?;
        self.charge(&mut child);
        let right_lsn = {
            let mut guard = sibling.write();
            self.log_node(&mut guard, false)?
        };
        self.register(&sibling);

        let children = parent.children_mut();
        children[index].target.lsn = left_lsn;
        children.insert(
            index + 1,
            ChildEntry {
                key: separator,
                target: ChildRef::new(new_id, right_lsn, Some(sibling)),
            },
        );
        self.log_node(parent, false)?;
        // The grandparent still refers to the previous image of the parent
        parent.dirty = true;
        self.charge(parent);

        self.ctx.stats.splits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Split {} at level {} of {} into {} and {}",
            child.id, child.level, self.db, child.id, new_id
        );
        Ok(())
    }

    fn split_root(&self) -> Result<()> {
        let mut root = self.root.write();
        let old_root = self.fetch(&root)?;
        let mut old_guard = old_root.write_arc();
        if !old_guard.is_full(self.ctx.max_entries) {
            return Ok(());
        }

        let level = old_guard.level;
        let sibling_id = self.ctx.allocate_node_id();
        let (separator, sibling) = old_guard.split(sibling_id);
        let sibling: NodeRef = Arc::new(RwLock::new(sibling));

        let left_lsn = self.log_node(&mut old_guard, false)?;
        self.charge(&mut old_guard);
        let right_lsn = {
            let mut guard = sibling.write();
            self.log_node(&mut guard, false)?
        };
        self.register(&sibling);

        let root_id = self.ctx.allocate_node_id();
        let new_root: NodeRef = Arc::new(RwLock::new(Node::new_internal(
            root_id,
            self.db,
            level + 1,
            Vec::new(),
            vec![
                ChildEntry {
                    key: Vec::new(),
                    target: ChildRef::new(old_guard.id, left_lsn, Some(old_root.clone())),
                },
                ChildEntry {
                    key: separator,
                    target: ChildRef::new(sibling_id, right_lsn, Some(sibling)),
                },
            ],
        )));
        let root_lsn = {
            let mut guard = new_root.write();
            self.log_node(&mut guard, false)?
        };
        self.register(&new_root);
        *root = ChildRef::new(root_id, root_lsn, Some(new_root));
        self.log_root(root_id, root_lsn)?;

        self.ctx.stats.root_splits.fetch_add(1, Ordering::Relaxed);
        info!("Root of {} split, height is now {}", self.name, level + 1);
        Ok(())
    }

    /// Locates the parent of a node by descending along its identifier key,
    /// and latches it exclusively.
    pub fn find_parent(&self, node_id: NodeID, level: u8, identifier_key: &[u8]) -> Result<ParentSearch<'_>> {
        loop {
            let root = self.root.read();
            if root.node_id == node_id {
                drop(root);
                let root = self.root.write();
                if root.node_id == node_id {
                    return Ok(ParentSearch::Root(root));
                }
                continue;
            }

            let root_node = self.fetch(&root)?;
            let root_level = root_node.read().level;
            if level >= root_level {
                return Ok(ParentSearch::NotFound);
            }

            let parent = if root_level == level + 1 {
                let guard = root_node.write_arc();
                drop(root);
                guard
            } else {
                let mut guard = root_node.read_arc();
                drop(root);
                loop {
                    let index = guard.child_index(identifier_key);
                    let child = self.fetch(&guard.children()[index].target)?;
                    if guard.level == level + 2 {
                        break child.write_arc();
                    }
                    guard = child.read_arc();
                }
            };

            return Ok(match parent.find_child_by_id(node_id) {
                Some(index) => ParentSearch::Found { parent, index },
                None => ParentSearch::NotFound,
            });
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let slot = match self.get_slot(key)? {
            Some(slot) if !slot.known_deleted => slot,
            _ => return Ok(None),
        };
        if slot.data.is_some() {
            return Ok(slot.data);
        }

        let data = self.fetch_ln_data(slot.lsn)?;
        self.cache_data(key, slot.lsn, &data)?;
        Ok(data)
    }

    /// The slot for `key` as currently in the tree, tombstones included.
    pub fn get_slot(&self, key: &[u8]) -> Result<Option<SlotInfo>> {
        let descent = self.descend_shared(key)?;
        let bin = &descent.guard;
        Ok(bin.slot_search(key).ok().map(|index| {
            let slot = &bin.slots()[index];
            SlotInfo {
                lsn: slot.lsn,
                known_deleted: slot.known_deleted,
                data: slot.data.clone(),
            }
        }))
    }

    /// Reads the record data written at `lsn`.
    pub fn fetch_ln_data(&self, lsn: Lsn) -> Result<Option<Vec<u8>>> {
        match self.ctx.log.read(lsn)? {
            LogEntry::Ln(ln) => Ok(ln.data),
            other => Err(LogTreeError::corruption(
                lsn,
                format!("expected a record but found a {:?} entry", other.entry_type()),
            )),
        }
    }

    fn cache_data(&self, key: &[u8], lsn: Lsn, data: &Option<Vec<u8>>) -> Result<()> {
        let mut bin = self.latch_bin_exclusive(key)?;
        if let Ok(index) = bin.slot_search(key) {
            let slot = &mut bin.slots_mut()[index];
            if slot.lsn == lsn && slot.data.is_none() {
                slot.data = data.clone();
                self.charge(&mut bin);
            }
        }
        Ok(())
    }

    /// Writes `data` (None to delete) for `key`. `make_entry` sees the slot
    /// state before the write, under the BIN latch, and returns the entry to
    /// log or None to leave the tree untouched.
    pub fn write<F>(&self, key: &[u8], data: Option<&[u8]>, make_entry: F) -> Result<Option<WriteOutcome>>
    where
        F: FnOnce(Option<SlotState>) -> Result<Option<LnEntry>>,
    {
        let mut bin = self.descend_for_write(key)?;
        let position = bin.slot_search(key);
        let previous = position.ok().map(|index| {
            let slot = &bin.slots()[index];
            SlotState {
                lsn: slot.lsn,
                known_deleted: slot.known_deleted,
            }
        });

        let entry = match make_entry(previous)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let lsn = self.ctx.log.append(&LogEntry::Ln(entry), FlushPolicy::None)?;

        let slot = LeafSlot {
            key: key.to_vec(),
            lsn,
            data: data.map(<[u8]>::to_vec),
            known_deleted: data.is_none(),
            dirty: true,
        };
        match position {
            Ok(index) => bin.slots_mut()[index] = slot,
            Err(index) => bin.slots_mut().insert(index, slot),
        }
        bin.dirty = true;
        self.charge(&mut bin);
        Ok(Some(WriteOutcome { lsn, previous }))
    }

    /// Rolls the slot for `key` back to its state before the write at
    /// `ln_lsn`. Does nothing if the slot has moved on.
    pub fn undo(&self, key: &[u8], ln_lsn: Lsn, abort_lsn: Option<Lsn>, abort_known_deleted: bool) -> Result<bool> {
        let mut bin = self.descend_for_write(key)?;
        let index = match bin.slot_search(key) {
            Ok(index) if bin.slots()[index].lsn == ln_lsn => index,
            _ => return Ok(false),
        };

        match abort_lsn {
            None => {
                bin.slots_mut().remove(index);
                bin.prohibit_delta = true;
            }
            Some(abort_lsn) => {
                let slot = &mut bin.slots_mut()[index];
                slot.lsn = abort_lsn;
                slot.data = None;
                slot.known_deleted = abort_known_deleted;
                slot.dirty = true;
            }
        }
        bin.dirty = true;
        self.charge(&mut bin);
        Ok(true)
    }

    /// Applies a logged record write if it is newer than the slot.
    pub fn redo_ln(&self, key: &[u8], lsn: Lsn, data: Option<&[u8]>) -> Result<RedoOutcome> {
        let mut bin = self.descend_for_write(key)?;
        let outcome = match bin.slot_search(key) {
            Ok(index) => {
                let slot = &mut bin.slots_mut()[index];
                if slot.lsn >= lsn {
                    return Ok(RedoOutcome::Skipped);
                }
                let replaced = slot.lsn;
                slot.lsn = lsn;
                slot.data = data.map(<[u8]>::to_vec);
                slot.known_deleted = data.is_none();
                slot.dirty = true;
                RedoOutcome::Replaced(replaced)
            }
            Err(index) => {
                let Some(data) = data else {
                    return Ok(RedoOutcome::Skipped);
                };
                bin.slots_mut().insert(
                    index,
                    LeafSlot {
                        key: key.to_vec(),
                        lsn,
                        data: Some(data.to_vec()),
                        known_deleted: false,
                        dirty: true,
                    },
                );
                RedoOutcome::Inserted
            }
        };
        bin.dirty = true;
        self.charge(&mut bin);
        Ok(outcome)
    }

    /// Replaces the tree's reference to a node with a newer logged image.
    pub fn redo_node(&self, node_id: NodeID, level: u8, identifier_key: &[u8], lsn: Lsn) -> Result<bool> {
        match self.find_parent(node_id, level, identifier_key)? {
            ParentSearch::Root(mut root) => {
                if root.lsn >= lsn {
                    return Ok(false);
                }
                if let Some(old) = root.resident() {
                    self.forget_subtree(&old);
                }
                *root = ChildRef::new(node_id, lsn, None);
                Ok(true)
            }
            ParentSearch::Found { mut parent, index } => {
                if parent.children()[index].target.lsn >= lsn {
                    return Ok(false);
                }
                if let Some(old) = parent.children()[index].target.resident() {
                    self.forget_subtree(&old);
                }
                parent.children_mut()[index].target = ChildRef::new(node_id, lsn, None);
                parent.dirty = true;
                Ok(true)
            }
            ParentSearch::NotFound => Ok(false),
        }
    }

    /// Installs a new root from a logged root record if it is newer.
    pub fn redo_root(&self, root_id: NodeID, root_lsn: Lsn) -> bool {
        let mut root = self.root.write();
        if root.lsn >= root_lsn {
            return false;
        }
        if let Some(old) = root.resident() {
            self.forget_subtree(&old);
        }
        *root = ChildRef::new(root_id, root_lsn, None);
        true
    }

    fn forget_subtree(&self, node: &NodeRef) {
        let guard = node.read();
        for entry in guard.children() {
            if let Some(child) = entry.target.resident() {
                self.forget_subtree(&child);
            }
        }
        self.ctx.cache.remove(guard.id, guard.memory_size());
    }

    /// Logs a dirty resident node and points its parent at the new image.
    pub fn flush_node(&self, node_id: NodeID, level: u8, identifier_key: &[u8], allow_delta: bool) -> Result<Option<Lsn>> {
        match self.find_parent(node_id, level, identifier_key)? {
            ParentSearch::Root(mut root) => {
                let Some(node) = root.resident() else {
                    return Ok(None);
                };
                let mut guard = node.write_arc();
                if !guard.dirty {
                    return Ok(None);
                }
                let lsn = self.log_node(&mut guard, allow_delta)?;
                root.lsn = lsn;
                drop(guard);
                self.log_root(node_id, lsn)?;
                Ok(Some(lsn))
            }
            ParentSearch::Found { mut parent, index } => {
                let Some(node) = parent.children()[index].target.resident() else {
                    return Ok(None);
                };
                let mut guard = node.write_arc();
                if !guard.dirty {
                    return Ok(None);
                }
                let lsn = self.log_node(&mut guard, allow_delta)?;
                parent.children_mut()[index].target.lsn = lsn;
                parent.dirty = true;
                Ok(Some(lsn))
            }
            ParentSearch::NotFound => Ok(None),
        }
    }

    /// Drops the record data of a resident BIN. Skips a BIN that is busy.
    pub fn strip_bin(&self, node: &NodeRef) -> usize {
        let Some(mut guard) = node.try_write_arc() else {
            return 0;
        };
        if !guard.is_bin() {
            return 0;
        }
        let stripped = guard.strip_data();
        if stripped > 0 {
            self.charge(&mut guard);
            self.ctx.cache.record_stripped(stripped);
        }
        stripped
    }

    /// Evicts a resident node whose children are all evicted, logging it
    /// first if dirty. Roots and pinned nodes stay.
    pub fn evict_node(&self, node: &NodeRef) -> Result<bool> {
        let (node_id, level, identifier_key) = {
            let guard = node.read();
            (guard.id, guard.level, guard.identifier_key.clone())
        };

        let (mut parent, index) = match self.find_parent(node_id, level, &identifier_key)? {
            ParentSearch::Found { parent, index } => (parent, index),
            _ => return Ok(false),
        };
        let Some(child) = parent.children()[index].target.resident() else {
            return Ok(false);
        };
        let mut guard = child.write_arc();
        if guard.is_pinned() || guard.has_resident_children() {
            return Ok(false);
        }

        if guard.dirty {
            let lsn = self.log_node(&mut guard, true)?;
            parent.children_mut()[index].target.lsn = lsn;
            parent.dirty = true;
        }
        parent.children()[index].target.set_resident(None);
        self.ctx.cache.remove(node_id, guard.memory_size());
        self.ctx.cache.record_evicted();
        debug!("Evicted {} at level {} of {}", node_id, level, self.db);
        Ok(true)
    }

    /// Re-logs the record at `lsn` for `key` at the head of the log if the
    /// tree still refers to it.
    pub fn migrate_ln<L>(&self, key: &[u8], lsn: Lsn, entry: &LnEntry, is_write_locked: L) -> Result<MigrateOutcome>
    where
        L: FnOnce() -> bool,
    {
        let mut bin = self.latch_bin_exclusive(key)?;
        if is_write_locked() {
            return Ok(MigrateOutcome::Locked);
        }
        let index = match bin.slot_search(key) {
            Ok(index) if bin.slots()[index].lsn == lsn => index,
            _ => return Ok(MigrateOutcome::Obsolete),
        };

        let migrated = LnEntry {
            txn: None,
            prev_lsn: None,
            abort_lsn: None,
            abort_known_deleted: false,
            ..entry.clone()
        };
        let new_lsn = self.ctx.log.append(&LogEntry::Ln(migrated), FlushPolicy::None)?;
        let slot = &mut bin.slots_mut()[index];
        slot.lsn = new_lsn;
        slot.dirty = true;
        bin.dirty = true;
        Ok(MigrateOutcome::Migrated(new_lsn))
    }

    /// Whether the node image at `lsn` is the current version of the node.
    /// A current node is dirtied, and barred from delta logging, so the next
    /// checkpoint writes it in full elsewhere.
    pub fn migrate_node(&self, node_id: NodeID, level: u8, identifier_key: &[u8], lsn: Lsn) -> Result<bool> {
        // Parent latch is held until the node is marked
        match self.find_parent(node_id, level, identifier_key)? {
            ParentSearch::Root(root) => {
                let node = self.fetch(&root)?;
                let mut guard = node.write_arc();
                Ok(Self::dirty_if_current(&mut guard, lsn))
            }
            ParentSearch::Found { parent, index } => {
                let node = self.fetch(&parent.children()[index].target)?;
                let mut guard = node.write_arc();
                Ok(Self::dirty_if_current(&mut guard, lsn))
            }
            ParentSearch::NotFound => Ok(false),
        }
    }

    fn dirty_if_current(node: &mut Node, lsn: Lsn) -> bool {
        if node.last_full_lsn != Some(lsn) && node.last_delta_lsn != Some(lsn) {
            return false;
        }
        node.dirty = true;
        node.prohibit_delta = true;
        true
    }

    /// Removes known-deleted, unlocked slots from the BIN covering `key`,
    /// and the BIN itself from its parent once empty.
    pub fn compress<L>(&self, key: &[u8], is_locked: L) -> Result<CompressOutcome>
    where
        L: Fn(&[u8]) -> bool,
    {
        let mut parent = match self.latch_bin_parent(key)? {
            BinParent::RootBin(mut root_bin) => {
                let (slots_removed, retry) = self.purge_deleted(&mut root_bin, &is_locked);
                return Ok(CompressOutcome {
                    slots_removed,
                    bin_removed: false,
                    retry,
                });
            }
            BinParent::Parent(parent) => parent,
        };

        let index = parent.child_index(key);
        let bin_ref = self.fetch(&parent.children()[index].target)?;
        let mut bin = bin_ref.write_arc();
        if bin.is_pinned() {
            return Ok(CompressOutcome {
                retry: true,
                ..CompressOutcome::default()
            });
        }
        let (slots_removed, retry) = self.purge_deleted(&mut bin, &is_locked);

        let bin_removed = !retry && bin.is_empty() && parent.len() > 1;
        if bin_removed {
            let tracker = &self.ctx.tracker;
            for previous in [bin.last_full_lsn, bin.last_delta_lsn].into_iter().flatten() {
                tracker.count_obsolete(previous, EntryKind::Node, None);
            }
            parent.children_mut().remove(index);
            parent.dirty = true;
            self.charge(&mut parent);
            self.ctx.cache.remove(bin.id, bin.memory_size());
            self.ctx.stats.bins_removed.fetch_add(1, Ordering::Relaxed);
            debug!("Removed empty {} from {}", bin.id, self.db);
        }
        Ok(CompressOutcome {
            slots_removed,
            bin_removed,
            retry,
        })
    }

    fn purge_deleted<L>(&self, bin: &mut Node, is_locked: &L) -> (usize, bool)
    where
        L: Fn(&[u8]) -> bool,
    {
        let mut removed = Vec::new();
        let mut retry = false;
        bin.slots_mut().retain(|slot| {
            if !slot.known_deleted {
                return true;
            }
            if is_locked(&slot.key) {
                retry = true;
                return true;
            }
            removed.push(slot.lsn);
            false
        });

        if !removed.is_empty() {
            self.ctx.tracker.count_obsolete_all(&removed, EntryKind::Ln);
            bin.dirty = true;
            bin.prohibit_delta = true;
            self.charge(bin);
            self.ctx
                .stats
                .slots_compressed
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
        }
        (removed.len(), retry)
    }

    /// Live slots of the BIN covering the start of `from`, and the key
    /// where the next BIN begins. The BIN is pinned; the caller unpins it.
    pub fn snapshot_bin(&self, from: &Bound<Vec<u8>>) -> Result<BinSnapshot> {
        let key: &[u8] = match from {
            Bound::Included(key) | Bound::Excluded(key) => key,
            Bound::Unbounded => &[],
        };
        let descent = self.descend_shared(key)?;
        let slots = descent
            .guard
            .slots()
            .iter()
            .filter(|slot| !slot.known_deleted)
            .filter(|slot| match from {
                Bound::Included(start) => slot.key >= *start,
                Bound::Excluded(start) => slot.key > *start,
                Bound::Unbounded => true,
            })
            .cloned()
            .collect();
        descent.guard.pin();
        Ok(BinSnapshot {
            node: descent.node,
            slots,
            upper_bound: descent.upper_bound,
        })
    }
}
