use super::{LogEntry, LogEntryHeader};
use crate::common::{LogTreeError, Lsn, Result};
use crate::storage::FileManager;

/// An entry read back from the log.
#[derive(Debug, Clone)]
pub struct LogItem {
    pub lsn: Lsn,
    pub header: LogEntryHeader,
    pub entry: LogEntry,
}

impl LogItem {
    pub fn size(&self) -> u32 {
        self.header.entry_size() as u32
    }
}

/// Decodes the entry at the start of `bytes`, validating its checksum.
pub fn decode_entry(bytes: &[u8], lsn: Lsn) -> Result<(LogEntryHeader, LogEntry)> {
    let header = LogEntryHeader::from_bytes(bytes, lsn)?;
    let size = header.entry_size();
    if bytes.len() < size {
        return Err(LogTreeError::corruption(
            lsn,
            format!("truncated entry: need {} bytes, have {}", size, bytes.len()),
        ));
    }

    let (header_bytes, rest) = bytes.split_at(LogEntryHeader::SIZE);
    let payload = &rest[..header.payload_size as usize];
    header.verify(header_bytes, payload, lsn)?;

    let entry = LogEntry::decode_payload(header.entry_type, payload)
        .map_err(|e| LogTreeError::corruption(lsn, format!("undecodable payload: {}", e)))?;
    Ok((header, entry))
}

/// Scans the log forward, one whole file in memory at a time. Only sees
/// bytes that reached the file system.
pub struct LogReader<'a> {
    files: &'a FileManager,
    file_numbers: Vec<u32>,
    next_file: usize,
    start: Lsn,
    end: Option<Lsn>,
    current: Option<(u32, Vec<u8>)>,
    offset: usize,
    done: bool,
}

impl<'a> LogReader<'a> {
    /// Reads entries from `start` up to, not including, `end`.
    pub fn new(files: &'a FileManager, start: Lsn, end: Option<Lsn>) -> Result<Self> {
        let file_numbers = files
            .list_files()?
            .into_iter()
            .filter(|file| *file >= start.file && end.map_or(true, |end| *file <= end.file))
            .collect();

        Ok(Self {
            files,
            file_numbers,
            next_file: 0,
            start,
            end,
            current: None,
            offset: 0,
            done: false,
        })
    }

    /// Reads every entry of a single file.
    pub fn for_file(files: &'a FileManager, file: u32) -> Result<Self> {
        Ok(Self {
            files,
            file_numbers: vec![file],
            next_file: 0,
            start: Lsn::new(file, 0),
            end: None,
            current: None,
            offset: 0,
            done: false,
        })
    }

    fn next_item(&mut self) -> Result<Option<LogItem>> {
        loop {
            if self.current.is_none() {
                let Some(&file) = self.file_numbers.get(self.next_file) else {
                    return Ok(None);
                };
                self.next_file += 1;
                let bytes = self.files.read_file(file)?;
                self.offset = if file == self.start.file {
                    self.start.offset as usize
                } else {
                    0
                };
                self.current = Some((file, bytes));
            }

            let Some((file, bytes)) = self.current.as_ref() else {
                continue;
            };
            let lsn = Lsn::new(*file, self.offset as u32);
            if self.end.map_or(false, |end| lsn >= end) {
                return Ok(None);
            }
            if self.offset >= bytes.len() {
                self.current = None;
                continue;
            }

            let (header, entry) = decode_entry(&bytes[self.offset..], lsn)?;
            self.offset += header.entry_size();
            return Ok(Some(LogItem { lsn, header, entry }));
        }
    }
}

impl Iterator for LogReader<'_> {
    type Item = Result<LogItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_item() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Walks the log backward from a known entry using each header's
/// prev-offset, hopping to the previous file through the file header.
pub struct BackwardReader<'a> {
    files: &'a FileManager,
    file: u32,
    bytes: Vec<u8>,
    next_offset: Option<u32>,
}

impl<'a> BackwardReader<'a> {
    pub fn new(files: &'a FileManager, file: u32, last_entry_offset: u32) -> Result<Self> {
        let bytes = files.read_file(file)?;
        Ok(Self {
            files,
            file,
            bytes,
            next_offset: Some(last_entry_offset),
        })
    }

    fn next_item(&mut self) -> Result<Option<LogItem>> {
        let Some(offset) = self.next_offset else {
            return Ok(None);
        };
        let lsn = Lsn::new(self.file, offset);
        let slice = self
            .bytes
            .get(offset as usize..)
            .ok_or_else(|| LogTreeError::corruption(lsn, "prev offset past end of file"))?;
        let (header, entry) = decode_entry(slice, lsn)?;

        self.next_offset = if offset > 0 {
            Some(header.prev_offset)
        } else {
            match &entry {
                LogEntry::FileHeader(file_header) => match file_header.prev_file_last_offset {
                    Some(prev_last) if self.file > 0 && self.files.exists(self.file - 1) => {
                        self.file -= 1;
                        self.bytes = self.files.read_file(self.file)?;
                        Some(prev_last)
                    }
                    _ => None,
                },
                _ => return Err(LogTreeError::corruption(lsn, "file does not start with a header")),
            }
        };

        Ok(Some(LogItem { lsn, header, entry }))
    }
}

impl Iterator for BackwardReader<'_> {
    type Item = Result<LogItem>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_item() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.next_offset = None;
                Some(Err(e))
            }
        }
    }
}
