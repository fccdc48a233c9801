use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use super::{EnvFiles, File, FileMode, PosixFile};
use crate::common::Result;

const MAX_OPEN_FILES: usize = 64;

type FileHandle = Arc<Mutex<Box<dyn File>>>;

#[derive(Debug, Default)]
pub struct FileStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub fsyncs: AtomicU64,
    pub files_deleted: AtomicU64,
}

impl FileStats {
    pub fn snapshot(&self) -> FileStatsSnapshot {
        FileStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
    pub files_deleted: u64,
}

impl fmt::Display for FileStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Files {{ reads: {}, writes: {}, read: {}B, written: {}B, fsyncs: {}, deleted: {} }}",
            self.reads, self.writes, self.bytes_read, self.bytes_written, self.fsyncs, self.files_deleted
        )
    }
}

/// Owns every open log file handle. All positional I/O on log files goes
/// through here; handles are opened lazily and kept in a bounded cache.
pub struct FileManager {
    files: EnvFiles,
    handles: Mutex<HashMap<u32, FileHandle>>,
    stats: FileStats,
}

impl FileManager {
    pub fn open(env_path: &Path) -> Result<Self> {
        let files = EnvFiles::new(env_path)?;
        info!("Opened environment directory {}", files.directory().display());
        Ok(Self {
            files,
            handles: Mutex::new(HashMap::new()),
            stats: FileStats::default(),
        })
    }

    pub fn list_files(&self) -> Result<Vec<u32>> {
        self.files.list_log_files()
    }

    pub fn exists(&self, file_number: u32) -> bool {
        self.files.get_log_file_path(file_number).exists()
    }

    fn handle(&self, file_number: u32, mode: FileMode) -> Result<FileHandle> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&file_number) {
            if mode == FileMode::READ || handle.lock().get_mode() == FileMode::WRITE {
                return Ok(handle.clone());
            }
        }

        if handles.len() >= MAX_OPEN_FILES {
            // Close the oldest file; the current file is always the newest
            if let Some(&victim) = handles.keys().min() {
                handles.remove(&victim);
            }
        }

        let path = self.files.get_log_file_path(file_number);
        let file: Box<dyn File> = Box::new(PosixFile::new(&path, mode)?);
        let handle = Arc::new(Mutex::new(file));
        handles.insert(file_number, handle.clone());
        Ok(handle)
    }

    /// Writes `bytes` at `offset`, creating the file if needed.
    pub fn write_at(&self, file_number: u32, offset: u32, bytes: &[u8]) -> Result<()> {
        let handle = self.handle(file_number, FileMode::WRITE)?;
        handle.lock().write_block(bytes, offset as usize)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn read_at(&self, file_number: u32, offset: u32, len: usize) -> Result<Vec<u8>> {
        let handle = self.handle(file_number, FileMode::READ)?;
        let bytes = handle.lock().read_block(offset as usize, len)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    /// Reads a whole file into memory.
    pub fn read_file(&self, file_number: u32) -> Result<Vec<u8>> {
        let size = self.file_size(file_number)?;
        self.read_at(file_number, 0, size as usize)
    }

    pub fn file_size(&self, file_number: u32) -> Result<u64> {
        let handle = self.handle(file_number, FileMode::READ)?;
        let size = handle.lock().size()?;
        Ok(size as u64)
    }

    /// Forces a file's contents to stable storage. A file without an open
    /// handle was synced when its handle was closed by rotation.
    pub fn sync(&self, file_number: u32) -> Result<()> {
        let handle = self.handles.lock().get(&file_number).cloned();
        if let Some(handle) = handle {
            handle.lock().sync()?;
            self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Syncs and closes a file that will not be written again.
    pub fn close_file(&self, file_number: u32) -> Result<()> {
        let handle = self.handles.lock().remove(&file_number);
        if let Some(handle) = handle {
            let mut file = handle.lock();
            if file.get_mode() == FileMode::WRITE {
                file.sync()?;
                self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn truncate(&self, file_number: u32, len: u64) -> Result<()> {
        let handle = self.handle(file_number, FileMode::WRITE)?;
        let mut file = handle.lock();
        file.resize(len as usize)?;
        file.sync()?;
        self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete_file(&self, file_number: u32) -> Result<()> {
        self.handles.lock().remove(&file_number);
        match fs::remove_file(self.files.get_log_file_path(file_number)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.stats.files_deleted.fetch_add(1, Ordering::Relaxed);
        debug!("Deleted log file {}", EnvFiles::log_file_name(file_number));
        Ok(())
    }

    /// Drops every cached handle without syncing.
    pub fn close_all(&self) {
        self.handles.lock().clear();
    }

    pub fn stats(&self) -> FileStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_io_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::open(dir.path()).unwrap();

        fm.write_at(0, 0, b"first file").unwrap();
        fm.write_at(1, 4, b"second").unwrap();
        fm.sync(1).unwrap();

        assert_eq!(fm.read_at(0, 6, 4).unwrap(), b"file");
        assert_eq!(fm.read_at(1, 4, 6).unwrap(), b"second");
        assert_eq!(fm.file_size(1).unwrap(), 10);
        assert_eq!(fm.list_files().unwrap(), vec![0, 1]);

        let stats = fm.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.fsyncs, 1);
    }

    #[test]
    fn test_truncate_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::open(dir.path()).unwrap();

        fm.write_at(2, 0, &[7u8; 100]).unwrap();
        fm.truncate(2, 40).unwrap();
        assert_eq!(fm.file_size(2).unwrap(), 40);
        assert!(fm.read_at(2, 30, 20).is_err());

        fm.delete_file(2).unwrap();
        assert!(!fm.exists(2));
        assert!(fm.read_at(2, 0, 1).is_err());
        // Deleting twice is harmless
        fm.delete_file(2).unwrap();
    }
}
