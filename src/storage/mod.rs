mod db_files;
mod file;
mod file_manager;

pub use db_files::EnvFiles;
pub use file::{File, FileMode, PosixFile};
pub use file_manager::{FileManager, FileStats, FileStatsSnapshot};
