use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::{Lsn, Result};
use crate::log_mod::LogEntryHeader;
use crate::storage::FileManager;

/// A run of consecutive log entries of one file, held in memory until it is
/// written out. Entries never straddle two buffers.
pub struct LogBuffer {
    file: u32,
    start_offset: u32,
    data: Vec<u8>,
    capacity: usize,
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            file: 0,
            start_offset: 0,
            data: Vec::with_capacity(capacity),
            capacity,
            first_lsn: None,
            last_lsn: None,
        }
    }

    fn reset(&mut self) {
        self.data.clear();
        self.first_lsn = None;
        self.last_lsn = None;
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn end_offset(&self) -> u32 {
        self.start_offset + self.data.len() as u32
    }

    pub fn has_room(&self, lsn: Lsn, len: usize) -> bool {
        if self.data.is_empty() {
            return len <= self.capacity;
        }
        self.file == lsn.file && self.end_offset() == lsn.offset && self.data.len() + len <= self.capacity
    }

    pub fn append(&mut self, lsn: Lsn, bytes: &[u8]) {
        if self.data.is_empty() {
            self.file = lsn.file;
            self.start_offset = lsn.offset;
            self.first_lsn = Some(lsn);
        }
        self.data.extend_from_slice(bytes);
        self.last_lsn = Some(lsn);
    }

    pub fn contains(&self, lsn: Lsn) -> bool {
        match (self.first_lsn, self.last_lsn) {
            (Some(first), Some(last)) => first <= lsn && lsn <= last,
            _ => false,
        }
    }

    /// Copies out the complete entry starting at `lsn`.
    pub fn read_entry(&self, lsn: Lsn) -> Option<Vec<u8>> {
        if !self.contains(lsn) {
            return None;
        }
        let start = (lsn.offset - self.start_offset) as usize;
        let header = LogEntryHeader::from_bytes(self.data.get(start..)?, lsn).ok()?;
        let end = start + header.entry_size();
        self.data.get(start..end).map(|bytes| bytes.to_vec())
    }

    pub fn file(&self) -> u32 {
        self.file
    }

    pub fn start_offset(&self) -> u32 {
        self.start_offset
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Default)]
pub struct BufferPoolStats {
    pub buffer_hits: AtomicU64,
    pub buffer_misses: AtomicU64,
    pub buffers_written: AtomicU64,
    pub temporary_buffers: AtomicU64,
}

impl BufferPoolStats {
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            buffer_hits: self.buffer_hits.load(Ordering::Relaxed),
            buffer_misses: self.buffer_misses.load(Ordering::Relaxed),
            buffers_written: self.buffers_written.load(Ordering::Relaxed),
            temporary_buffers: self.temporary_buffers.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferPoolStatsSnapshot {
    pub buffer_hits: u64,
    pub buffer_misses: u64,
    pub buffers_written: u64,
    pub temporary_buffers: u64,
}

impl fmt::Display for BufferPoolStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogBuffers {{ hits: {}, misses: {}, written: {}, temporary: {} }}",
            self.buffer_hits, self.buffer_misses, self.buffers_written, self.temporary_buffers
        )
    }
}

struct PoolState {
    current: LogBuffer,
    // Full buffers waiting to be written, oldest first
    dirty: VecDeque<Arc<LogBuffer>>,
    // Written buffers kept around for reads, oldest first
    clean: VecDeque<Arc<LogBuffer>>,
}

/// Ring of log write buffers. Appends and write-outs must be serialized by
/// the caller (the log manager's write latch); reads may come from any
/// thread. A reader holding an `Arc` to a buffer keeps it pinned.
pub struct LogBufferPool {
    state: Mutex<PoolState>,
    buffer_size: usize,
    num_buffers: usize,
    stats: BufferPoolStats,
}

impl LogBufferPool {
    pub fn new(num_buffers: usize, buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                current: LogBuffer::new(buffer_size),
                dirty: VecDeque::with_capacity(num_buffers),
                clean: VecDeque::with_capacity(num_buffers),
            }),
            buffer_size,
            num_buffers,
            stats: BufferPoolStats::default(),
        }
    }

    fn recycle(&self, state: &mut PoolState) -> LogBuffer {
        while let Some(buffer) = state.clean.pop_front() {
            // Still pinned by a reader: let it go and allocate instead
            if let Ok(mut buffer) = Arc::try_unwrap(buffer) {
                buffer.reset();
                return buffer;
            }
        }
        LogBuffer::new(self.buffer_size)
    }

    /// Copies a complete entry into the pool at `lsn`, writing out older
    /// buffers first if the ring is exhausted.
    pub fn append(&self, lsn: Lsn, bytes: &[u8], files: &FileManager) -> Result<()> {
        let must_write = {
            let mut state = self.state.lock();
            if state.current.has_room(lsn, bytes.len()) {
                state.current.append(lsn, bytes);
                return Ok(());
            }

            if !state.current.is_empty() {
                let full = std::mem::replace(&mut state.current, LogBuffer::new(0));
                state.dirty.push_back(Arc::new(full));
            }
            state.dirty.len() + 1 >= self.num_buffers || bytes.len() > self.buffer_size
        };

        if must_write {
            self.write_dirty(files)?;
        }

        let mut state = self.state.lock();
        let mut buffer = if bytes.len() > self.buffer_size {
            self.stats.temporary_buffers.fetch_add(1, Ordering::Relaxed);
            debug!("Temporary log buffer of {} bytes for {}", bytes.len(), lsn);
            LogBuffer::new(bytes.len())
        } else {
            self.recycle(&mut state)
        };
        buffer.append(lsn, bytes);
        state.current = buffer;
        Ok(())
    }

    /// Writes every full buffer to its file, oldest first.
    fn write_dirty(&self, files: &FileManager) -> Result<()> {
        let pending: Vec<Arc<LogBuffer>> = self.state.lock().dirty.iter().cloned().collect();
        for buffer in &pending {
            files.write_at(buffer.file(), buffer.start_offset(), buffer.data())?;
        }

        let mut state = self.state.lock();
        for _ in 0..pending.len() {
            if let Some(buffer) = state.dirty.pop_front() {
                state.clean.push_back(buffer);
            }
        }
        while state.clean.len() >= self.num_buffers {
            state.clean.pop_front();
        }
        self.stats
            .buffers_written
            .fetch_add(pending.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Writes everything buffered, including the partly filled current
    /// buffer, to the file system.
    pub fn flush(&self, files: &FileManager) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.current.is_empty() {
                let next = self.recycle(&mut state);
                let full = std::mem::replace(&mut state.current, next);
                state.dirty.push_back(Arc::new(full));
            }
        }
        self.write_dirty(files)
    }

    /// Drops buffered bytes without writing them.
    pub fn discard(&self) {
        let mut state = self.state.lock();
        state.current.reset();
        state.dirty.clear();
        state.clean.clear();
    }

    /// Looks up the entry at `lsn` in the resident buffers.
    pub fn read(&self, lsn: Lsn) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let found = state.current.read_entry(lsn).or_else(|| {
            state
                .dirty
                .iter()
                .rev()
                .chain(state.clean.iter().rev())
                .find(|buffer| buffer.contains(lsn))
                .and_then(|buffer| buffer.read_entry(lsn))
        });

        if found.is_some() {
            self.stats.buffer_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.buffer_misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn stats(&self) -> BufferPoolStatsSnapshot {
        self.stats.snapshot()
    }
}
