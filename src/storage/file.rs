use std::fs::{File as StdFile, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::{LogTreeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    READ,
    WRITE,
}

// File abstraction used by the file manager for log files

pub trait File: Send {
    fn get_mode(&self) -> FileMode;
    fn size(&self) -> Result<usize>;
    fn resize(&mut self, new_size: usize) -> Result<()>;
    fn read_block(&mut self, offset: usize, size: usize) -> Result<Vec<u8>>;
    fn write_block(&mut self, block: &[u8], offset: usize) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

pub struct PosixFile {
    mode: FileMode,
    file: StdFile,
    cached_size: usize,
}

impl PosixFile {
    pub fn new(path: &Path, mode: FileMode) -> Result<Self> {
        let file = match mode {
            FileMode::READ => OpenOptions::new().read(true).open(path)?,
            FileMode::WRITE => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
        };

        let cached_size = file.metadata()?.len() as usize;

        Ok(Self {
            mode,
            file,
            cached_size,
        })
    }
}

impl File for PosixFile {
    fn get_mode(&self) -> FileMode {
        self.mode
    }

    fn size(&self) -> Result<usize> {
        Ok(self.cached_size)
    }

    fn resize(&mut self, new_size: usize) -> Result<()> {
        if new_size == self.cached_size {
            return Ok(());
        }

        if self.mode == FileMode::READ {
            return Err(LogTreeError::IOError(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cannot resize a read-only log file",
            )));
        }

        self.file.set_len(new_size as u64)?;
        self.cached_size = new_size;

        Ok(())
    }

    fn read_block(&mut self, offset: usize, size: usize) -> Result<Vec<u8>> {
        // Bounds check - don't read past EOF
        if offset + size > self.cached_size {
            return Err(LogTreeError::IOError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read past end of file: offset={}, size={}, filesize={}",
                    offset, size, self.cached_size
                ),
            )));
        }

        let mut buffer = vec![0u8; size];
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_block(&mut self, block: &[u8], offset: usize) -> Result<()> {
        if self.mode == FileMode::READ {
            return Err(LogTreeError::IOError(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cannot write to a read-only log file",
            )));
        }

        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(block)?;
        self.cached_size = self.cached_size.max(offset + block.len());

        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.mode == FileMode::WRITE {
            self.file.sync_data()?;
        }
        Ok(())
    }
}
