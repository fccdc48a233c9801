mod checkpointer;
#[allow(clippy::module_inception)]
mod recovery;

pub use checkpointer::{CheckpointReport, Checkpointer, CheckpointerStatsSnapshot};
pub use recovery::{find_last_checkpoint, validate_tail, LogTail, RecoveryManager, RecoveryReport};
