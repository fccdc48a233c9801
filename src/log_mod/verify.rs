use std::path::Path;

use log::{info, warn};

use super::LogReader;
use crate::common::{Lsn, Result};
use crate::storage::FileManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyReport {
    pub files_checked: u32,
    pub entries_checked: u64,
    pub bytes_checked: u64,
}

/// Reads every entry of every log file and validates its checksum. Fails
/// with the first corruption found.
pub fn verify_log(files: &FileManager) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    for file in files.list_files()? {
        for item in LogReader::for_file(files, file)? {
            let item = item?;
            report.entries_checked += 1;
            report.bytes_checked += item.size() as u64;
        }
        report.files_checked += 1;
    }
    info!(
        "Verified {} entries in {} log files",
        report.entries_checked, report.files_checked
    );
    Ok(report)
}

/// Cuts the log of a closed environment at `lsn`: every file after
/// `lsn.file` is deleted and `lsn.file` is truncated to `lsn.offset` bytes
/// (deleted entirely when the offset is zero).
pub fn truncate_log(env_path: &Path, lsn: Lsn) -> Result<()> {
    let files = FileManager::open(env_path)?;
    for file in files.list_files()? {
        if file > lsn.file || (file == lsn.file && lsn.offset == 0) {
            files.delete_file(file)?;
        } else if file == lsn.file {
            files.truncate(file, lsn.offset as u64)?;
        }
    }
    warn!("Log in {} truncated at {}", env_path.display(), lsn);
    Ok(())
}
