mod compressor;
mod cursor;
mod evictor;
mod node;
mod node_cache;
mod registry;
#[allow(clippy::module_inception)]
mod tree;

pub use compressor::{Compressor, CompressorStatsSnapshot};
pub use cursor::{Cursor, CursorEntry};
pub use evictor::{EvictReport, Evictor, EvictorStatsSnapshot};
pub use node::{ChildEntry, ChildRef, LeafSlot, Node, NodeEntries, NodeReadGuard, NodeRef, NodeWriteGuard};
pub use node_cache::{CacheStatsSnapshot, NodeCache, ResidentNode};
pub use registry::DatabaseRegistry;
pub use tree::{
    BinSnapshot, CompressOutcome, MigrateOutcome, ParentSearch, RedoOutcome, SlotInfo, SlotState, Tree, TreeContext,
    TreeStatsSnapshot, WriteOutcome,
};
