#[allow(clippy::module_inception)]
mod cleaner;
mod file_selector;
mod utilization;

pub use cleaner::{CleanReport, Cleaner, CleanerStatsSnapshot};
pub use file_selector::{select_files, SelectionParams};
pub use utilization::{EntryKind, FileSummary, UtilizationTracker};
