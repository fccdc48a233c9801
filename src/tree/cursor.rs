use std::collections::VecDeque;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use super::node::{LeafSlot, NodeRef};
use super::tree::Tree;
use crate::common::{Lsn, Result};

/// A live record seen by a cursor. `data` is None when the record data was
/// not resident at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    pub key: Vec<u8>,
    pub lsn: Lsn,
    pub data: Option<Vec<u8>>,
}

/// Forward cursor over a key range. It copies the live slots of one BIN at
/// a time, keeping that BIN pinned, and moves on by re-descending with the
/// next key so concurrent splits are tolerated.
pub struct Cursor {
    tree: Arc<Tree>,
    position: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    pending: VecDeque<LeafSlot>,
    next_bin: Option<Vec<u8>>,
    pinned: Option<NodeRef>,
    done: bool,
}

impl Cursor {
    pub fn new<R: RangeBounds<Vec<u8>>>(tree: Arc<Tree>, range: R) -> Self {
        Self {
            tree,
            position: range.start_bound().cloned(),
            end: range.end_bound().cloned(),
            pending: VecDeque::new(),
            next_bin: None,
            pinned: None,
            done: false,
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn unpin(&mut self) {
        if let Some(node) = self.pinned.take() {
            node.read().unpin();
        }
    }

    fn load_next_bin(&mut self) -> Result<()> {
        let snapshot = self.tree.snapshot_bin(&self.position)?;
        self.unpin();
        self.pinned = Some(snapshot.node);
        self.pending = snapshot.slots.into();
        self.next_bin = snapshot.upper_bound;
        Ok(())
    }

    pub fn next_entry(&mut self) -> Result<Option<CursorEntry>> {
        loop {
            if let Some(slot) = self.pending.pop_front() {
                if self.past_end(&slot.key) {
                    self.finish();
                    return Ok(None);
                }
                self.position = Bound::Excluded(slot.key.clone());
                return Ok(Some(CursorEntry {
                    key: slot.key,
                    lsn: slot.lsn,
                    data: slot.data,
                }));
            }
            if self.done {
                return Ok(None);
            }

            if self.pinned.is_some() {
                // Current BIN is drained
                match self.next_bin.take() {
                    Some(next) => {
                        if self.past_end(&next) {
                            self.finish();
                            return Ok(None);
                        }
                        self.position = Bound::Included(next);
                    }
                    None => {
                        self.finish();
                        return Ok(None);
                    }
                }
            }
            self.load_next_bin()?;
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.pending.clear();
        self.unpin();
    }
}

impl Iterator for Cursor {
    type Item = Result<CursorEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.unpin();
    }
}
