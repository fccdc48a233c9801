use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::common::{DatabaseID, Lsn, NodeID};
use crate::log_mod::{InDeltaEntry, InEntry, NodeSlot};

pub type NodeRef = Arc<RwLock<Node>>;
pub type NodeReadGuard = ArcRwLockReadGuard<RawRwLock, Node>;
pub type NodeWriteGuard = ArcRwLockWriteGuard<RawRwLock, Node>;

// Rough per-object overheads used for the memory budget
const NODE_OVERHEAD: usize = 160;
const ENTRY_OVERHEAD: usize = 64;

/// Reference from a parent (or the root latch) to a child node: its id, the
/// LSN of its latest logged image, and the node itself when resident.
pub struct ChildRef {
    pub node_id: NodeID,
    pub lsn: Lsn,
    resident: Mutex<Option<NodeRef>>,
}

impl ChildRef {
    pub fn new(node_id: NodeID, lsn: Lsn, resident: Option<NodeRef>) -> Self {
        Self {
            node_id,
            lsn,
            resident: Mutex::new(resident),
        }
    }

    pub fn resident(&self) -> Option<NodeRef> {
        self.resident.lock().clone()
    }

    pub fn is_resident(&self) -> bool {
        self.resident.lock().is_some()
    }

    pub fn set_resident(&self, node: Option<NodeRef>) {
        *self.resident.lock() = node;
    }

    /// Returns the resident node or loads it with `load`, holding the slot
    /// while loading so a node is only ever materialized once.
    pub fn get_or_load<F>(&self, load: F) -> crate::common::Result<(NodeRef, bool)>
    where
        F: FnOnce(NodeID, Lsn) -> crate::common::Result<NodeRef>,
    {
        let mut resident = self.resident.lock();
        if let Some(node) = resident.as_ref() {
            return Ok((node.clone(), false));
        }
        let node = load(self.node_id, self.lsn)?;
        *resident = Some(node.clone());
        Ok((node, true))
    }
}

pub struct ChildEntry {
    pub key: Vec<u8>,
    pub target: ChildRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSlot {
    pub key: Vec<u8>,
    pub lsn: Lsn,
    pub data: Option<Vec<u8>>,
    pub known_deleted: bool,
    pub dirty: bool,
}

pub enum NodeEntries {
    Internal(Vec<ChildEntry>),
    Bottom(Vec<LeafSlot>),
}

/// A tree node. Level 1 nodes are BINs holding leaf slots; higher levels
/// hold child references. The first entry key of an internal node is never
/// compared against.
pub struct Node {
    pub id: NodeID,
    pub db: DatabaseID,
    pub level: u8,
    pub identifier_key: Vec<u8>,
    pub entries: NodeEntries,
    pub dirty: bool,
    pub last_full_lsn: Option<Lsn>,
    pub last_delta_lsn: Option<Lsn>,
    // Set when the node changed in a way a delta cannot express
    pub prohibit_delta: bool,
    pins: AtomicU32,
    memory_size: usize,
}

impl Node {
    pub fn new_bin(id: NodeID, db: DatabaseID, identifier_key: Vec<u8>, slots: Vec<LeafSlot>) -> Self {
        Self::new(id, db, 1, identifier_key, NodeEntries::Bottom(slots))
    }

    pub fn new_internal(
        id: NodeID,
        db: DatabaseID,
        level: u8,
        identifier_key: Vec<u8>,
        children: Vec<ChildEntry>,
    ) -> Self {
        Self::new(id, db, level, identifier_key, NodeEntries::Internal(children))
    }

    fn new(id: NodeID, db: DatabaseID, level: u8, identifier_key: Vec<u8>, entries: NodeEntries) -> Self {
        let mut node = Self {
            id,
            db,
            level,
            identifier_key,
            entries,
            dirty: true,
            last_full_lsn: None,
            last_delta_lsn: None,
            prohibit_delta: true,
            pins: AtomicU32::new(0),
            memory_size: 0,
        };
        node.memory_size = node.compute_memory_size();
        node
    }

    pub fn is_bin(&self) -> bool {
        self.level == 1
    }

    pub fn len(&self) -> usize {
        match &self.entries {
            NodeEntries::Internal(children) => children.len(),
            NodeEntries::Bottom(slots) => slots.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self, max_entries: usize) -> bool {
        self.len() >= max_entries
    }

    pub fn children(&self) -> &[ChildEntry] {
        match &self.entries {
            NodeEntries::Internal(children) => children,
            NodeEntries::Bottom(_) => &[],
        }
    }

    pub fn children_mut(&mut self) -> &mut Vec<ChildEntry> {
        match &mut self.entries {
            NodeEntries::Internal(children) => children,
            NodeEntries::Bottom(_) => unreachable!("BIN {} has no children", self.id),
        }
    }

    pub fn slots(&self) -> &[LeafSlot] {
        match &self.entries {
            NodeEntries::Bottom(slots) => slots,
            NodeEntries::Internal(_) => &[],
        }
    }

    pub fn slots_mut(&mut self) -> &mut Vec<LeafSlot> {
        match &mut self.entries {
            NodeEntries::Bottom(slots) => slots,
            NodeEntries::Internal(_) => unreachable!("IN {} has no leaf slots", self.id),
        }
    }

    /// Index of the child whose key range covers `key`.
    pub fn child_index(&self, key: &[u8]) -> usize {
        let children = self.children();
        if children.len() <= 1 {
            return 0;
        }
        // Last entry whose key is <= key; entry 0 covers everything below
        children[1..].partition_point(|entry| entry.key.as_slice() <= key)
    }

    pub fn slot_search(&self, key: &[u8]) -> Result<usize, usize> {
        self.slots().binary_search_by(|slot| slot.key.as_slice().cmp(key))
    }

    pub fn find_child_by_id(&self, node_id: NodeID) -> Option<usize> {
        self.children().iter().position(|entry| entry.target.node_id == node_id)
    }

    pub fn has_resident_children(&self) -> bool {
        self.children().iter().any(|entry| entry.target.is_resident())
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub fn dirty_slot_count(&self) -> usize {
        self.slots().iter().filter(|slot| slot.dirty).count()
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
        if let NodeEntries::Bottom(slots) = &mut self.entries {
            for slot in slots.iter_mut() {
                slot.dirty = false;
            }
        }
    }

    /// Whether the next log of this node may be a delta.
    pub fn can_log_delta(&self, delta_percent: u32) -> bool {
        self.is_bin()
            && !self.prohibit_delta
            && self.last_full_lsn.is_some()
            && !self.is_empty()
            && self.dirty_slot_count() * 100 <= self.len() * delta_percent as usize
    }

    /// Moves the upper half of the entries into a new sibling with id
    /// `new_id`. Returns the separator key, which is also the sibling's
    /// identifier key.
    pub fn split(&mut self, new_id: NodeID) -> (Vec<u8>, Node) {
        let mid = self.len() / 2;
        let sibling = match &mut self.entries {
            NodeEntries::Bottom(slots) => {
                let upper: Vec<LeafSlot> = slots
                    .split_off(mid)
                    .into_iter()
                    .map(|slot| LeafSlot { dirty: true, ..slot })
                    .collect();
                let separator = upper[0].key.clone();
                Node::new_bin(new_id, self.db, separator, upper)
            }
            NodeEntries::Internal(children) => {
                let upper = children.split_off(mid);
                let separator = upper[0].key.clone();
                Node::new_internal(new_id, self.db, self.level, separator, upper)
            }
        };
        self.dirty = true;
        self.prohibit_delta = true;
        (sibling.identifier_key.clone(), sibling)
    }

    fn compute_memory_size(&self) -> usize {
        let entries: usize = match &self.entries {
            NodeEntries::Internal(children) => children
                .iter()
                .map(|entry| ENTRY_OVERHEAD + entry.key.len())
                .sum(),
            NodeEntries::Bottom(slots) => slots
                .iter()
                .map(|slot| ENTRY_OVERHEAD + slot.key.len() + slot.data.as_ref().map_or(0, Vec::len))
                .sum(),
        };
        NODE_OVERHEAD + self.identifier_key.len() + entries
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    /// Recomputes the memory estimate, returning the change.
    pub fn refresh_memory_size(&mut self) -> i64 {
        let new_size = self.compute_memory_size();
        let delta = new_size as i64 - self.memory_size as i64;
        self.memory_size = new_size;
        delta
    }

    /// Drops resident record data from every slot. Returns how many slots
    /// were stripped.
    pub fn strip_data(&mut self) -> usize {
        let mut stripped = 0;
        if let NodeEntries::Bottom(slots) = &mut self.entries {
            for slot in slots.iter_mut() {
                if slot.data.take().is_some() {
                    stripped += 1;
                }
            }
        }
        stripped
    }

    fn node_slots(&self) -> Vec<NodeSlot> {
        match &self.entries {
            NodeEntries::Internal(children) => children
                .iter()
                .map(|entry| NodeSlot {
                    key: entry.key.clone(),
                    child: Some(entry.target.node_id),
                    lsn: entry.target.lsn,
                    known_deleted: false,
                })
                .collect(),
            NodeEntries::Bottom(slots) => slots.iter().map(leaf_to_node_slot).collect(),
        }
    }

    pub fn to_in_entry(&self) -> InEntry {
        InEntry {
            node_id: self.id,
            db: self.db,
            level: self.level,
            identifier_key: self.identifier_key.clone(),
            slots: self.node_slots(),
        }
    }

    /// Delta against the last full image: the dirty slots only.
    pub fn to_delta(&self, base_lsn: Lsn) -> InDeltaEntry {
        InDeltaEntry {
            node_id: self.id,
            db: self.db,
            identifier_key: self.identifier_key.clone(),
            base_lsn,
            slots: self
                .slots()
                .iter()
                .filter(|slot| slot.dirty)
                .map(leaf_to_node_slot)
                .collect(),
        }
    }

    /// Rebuilds a node from its logged image. Children are not resident and
    /// records carry no data until fetched.
    pub fn from_in_entry(image: &InEntry, lsn: Lsn) -> Node {
        let entries = if image.is_bin() {
            NodeEntries::Bottom(
                image
                    .slots
                    .iter()
                    .map(|slot| LeafSlot {
                        key: slot.key.clone(),
                        lsn: slot.lsn,
                        data: None,
                        known_deleted: slot.known_deleted,
                        dirty: false,
                    })
                    .collect(),
            )
        } else {
            NodeEntries::Internal(
                image
                    .slots
                    .iter()
                    .map(|slot| ChildEntry {
                        key: slot.key.clone(),
                        target: ChildRef::new(slot.child.unwrap_or(NodeID(0)), slot.lsn, None),
                    })
                    .collect(),
            )
        };

        let mut node = Node::new(image.node_id, image.db, image.level, image.identifier_key.clone(), entries);
        node.dirty = false;
        node.prohibit_delta = false;
        node.last_full_lsn = Some(lsn);
        node
    }

    /// Applies a delta on top of the full image this node was built from.
    /// The delta's slots stay dirty so the next delta still carries them.
    pub fn apply_delta(&mut self, delta: &InDeltaEntry, delta_lsn: Lsn) {
        let slots = self.slots_mut();
        for changed in &delta.slots {
            let slot = LeafSlot {
                key: changed.key.clone(),
                lsn: changed.lsn,
                data: None,
                known_deleted: changed.known_deleted,
                dirty: true,
            };
            match slots.binary_search_by(|s| s.key.as_slice().cmp(&changed.key)) {
                Ok(i) => slots[i] = slot,
                Err(i) => slots.insert(i, slot),
            }
        }
        self.last_delta_lsn = Some(delta_lsn);
        self.refresh_memory_size();
    }
}

fn leaf_to_node_slot(slot: &LeafSlot) -> NodeSlot {
    NodeSlot {
        key: slot.key.clone(),
        child: None,
        lsn: slot.lsn,
        known_deleted: slot.known_deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slot(key: &[u8], offset: u32) -> LeafSlot {
        LeafSlot {
            key: key.to_vec(),
            lsn: Lsn::new(0, offset),
            data: Some(vec![1, 2, 3]),
            known_deleted: false,
            dirty: true,
        }
    }

    #[test]
    fn test_child_index_uses_separators() {
        let children = vec![
            ChildEntry {
                key: Vec::new(),
                target: ChildRef::new(NodeID(1), Lsn::new(0, 10), None),
            },
            ChildEntry {
                key: b"m".to_vec(),
                target: ChildRef::new(NodeID(2), Lsn::new(0, 20), None),
            },
            ChildEntry {
                key: b"t".to_vec(),
                target: ChildRef::new(NodeID(3), Lsn::new(0, 30), None),
            },
        ];
        let node = Node::new_internal(NodeID(9), DatabaseID(1), 2, Vec::new(), children);

        assert_eq!(node.child_index(b"a"), 0);
        assert_eq!(node.child_index(b"m"), 1);
        assert_eq!(node.child_index(b"s"), 1);
        assert_eq!(node.child_index(b"zz"), 2);
        assert_eq!(node.find_child_by_id(NodeID(3)), Some(2));
    }

    #[test]
    fn test_split_moves_upper_half() {
        let slots = (0u8..10).map(|i| slot(&[b'a' + i], i as u32)).collect();
        let mut node = Node::new_bin(NodeID(1), DatabaseID(1), Vec::new(), slots);

        let (separator, sibling) = node.split(NodeID(2));
        assert_eq!(node.len(), 5);
        assert_eq!(sibling.len(), 5);
        assert_eq!(separator, b"f".to_vec());
        assert_eq!(sibling.identifier_key, separator);
        assert!(node.slots().iter().all(|s| s.key < separator));
    }

    #[test]
    fn test_delta_applies_over_base() {
        let slots = vec![slot(b"a", 1), slot(b"b", 2), slot(b"c", 3)];
        let mut node = Node::new_bin(NodeID(1), DatabaseID(1), Vec::new(), slots);
        let base = node.to_in_entry();
        node.mark_clean();

        node.slots_mut()[1].lsn = Lsn::new(0, 50);
        node.slots_mut()[1].dirty = true;
        node.slots_mut().push(slot(b"d", 60));
        let delta = node.to_delta(Lsn::new(0, 100));
        assert_eq!(delta.slots.len(), 2);

        let mut rebuilt = Node::from_in_entry(&base, Lsn::new(0, 100));
        rebuilt.apply_delta(&delta, Lsn::new(0, 200));
        let keys: Vec<_> = rebuilt.slots().iter().map(|s| (s.key.clone(), s.lsn)).collect();
        assert_eq!(
            keys,
            vec![
                (b"a".to_vec(), Lsn::new(0, 1)),
                (b"b".to_vec(), Lsn::new(0, 50)),
                (b"c".to_vec(), Lsn::new(0, 3)),
                (b"d".to_vec(), Lsn::new(0, 60)),
            ]
        );
        assert_eq!(rebuilt.last_delta_lsn, Some(Lsn::new(0, 200)));
    }

    #[test]
    fn test_rebuilt_delta_slots_carry_into_next_delta() {
        let slots = vec![slot(b"a", 1), slot(b"b", 2), slot(b"c", 3)];
        let mut node = Node::new_bin(NodeID(1), DatabaseID(1), Vec::new(), slots);
        let base = node.to_in_entry();
        node.mark_clean();
        node.slots_mut()[0].lsn = Lsn::new(0, 50);
        node.slots_mut()[0].dirty = true;
        let first = node.to_delta(Lsn::new(0, 100));

        let mut rebuilt = Node::from_in_entry(&base, Lsn::new(0, 100));
        rebuilt.apply_delta(&first, Lsn::new(0, 200));
        rebuilt.slots_mut()[2].lsn = Lsn::new(0, 300);
        rebuilt.slots_mut()[2].dirty = true;
        let second = rebuilt.to_delta(Lsn::new(0, 100));
        let keys: Vec<_> = second.slots.iter().map(|s| (s.key.clone(), s.lsn)).collect();
        assert_eq!(
            keys,
            vec![(b"a".to_vec(), Lsn::new(0, 50)), (b"c".to_vec(), Lsn::new(0, 300))]
        );
    }

    #[test]
    fn test_strip_data_shrinks_memory() {
        let slots = vec![slot(b"a", 1), slot(b"b", 2)];
        let mut node = Node::new_bin(NodeID(1), DatabaseID(1), Vec::new(), slots);
        let before = node.memory_size();
        assert_eq!(node.strip_data(), 2);
        assert!(node.refresh_memory_size() < 0);
        assert!(node.memory_size() < before);
    }

    proptest! {
        #[test]
        fn bin_image_round_trips(
            keys in proptest::collection::btree_set(proptest::collection::vec(any::<u8>(), 1..12), 0..40),
            deleted in any::<u64>(),
        ) {
            let slots: Vec<LeafSlot> = keys
                .iter()
                .enumerate()
                .map(|(i, key)| LeafSlot {
                    key: key.clone(),
                    lsn: Lsn::new(1, i as u32 * 10),
                    data: None,
                    known_deleted: deleted & (1 << (i % 64)) != 0,
                    dirty: false,
                })
                .collect();
            let node = Node::new_bin(NodeID(7), DatabaseID(2), b"id".to_vec(), slots.clone());

            let image = node.to_in_entry();
            let bytes = bincode::serialize(&image).unwrap();
            let decoded: InEntry = bincode::deserialize(&bytes).unwrap();
            let rebuilt = Node::from_in_entry(&decoded, Lsn::new(3, 0));

            prop_assert_eq!(rebuilt.id, NodeID(7));
            prop_assert_eq!(rebuilt.db, DatabaseID(2));
            prop_assert_eq!(&rebuilt.identifier_key, &b"id".to_vec());
            prop_assert_eq!(rebuilt.slots(), slots.as_slice());
            prop_assert_eq!(rebuilt.last_full_lsn, Some(Lsn::new(3, 0)));
        }
    }
}
