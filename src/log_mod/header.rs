//! Log entry header.
//!
//! Every entry is a fixed 16-byte little endian header followed by a bincode
//! payload.
//!
//! Layout:
//! - checksum: 4 bytes (CRC32 of header bytes 4..16 + payload)
//! - entry_type: 1 byte
//! - version: 1 byte
//! - prev_offset: 4 bytes (offset of the previous entry in the same file)
//! - payload_size: 4 bytes
//! - flags: 1 byte
//! - reserved: 1 byte

use super::LogEntryType;
use crate::common::config::{ENTRY_HEADER_SIZE, LOG_FORMAT_VERSION};
use crate::common::{LogTreeError, Lsn, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntryHeader {
    pub checksum: u32,
    pub entry_type: LogEntryType,
    pub version: u8,
    pub prev_offset: u32,
    pub payload_size: u32,
    pub flags: u8,
}

impl LogEntryHeader {
    pub const SIZE: usize = ENTRY_HEADER_SIZE;
    pub const FLAG_TRANSACTIONAL: u8 = 0x01;

    pub fn new(entry_type: LogEntryType, prev_offset: u32, payload_size: u32, flags: u8) -> Self {
        Self {
            checksum: 0,
            entry_type,
            version: LOG_FORMAT_VERSION,
            prev_offset,
            payload_size,
            flags,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.flags & Self::FLAG_TRANSACTIONAL != 0
    }

    /// Total bytes taken by the entry in the log.
    pub fn entry_size(&self) -> usize {
        Self::SIZE + self.payload_size as usize
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4] = self.entry_type as u8;
        buf[5] = self.version;
        buf[6..10].copy_from_slice(&self.prev_offset.to_le_bytes());
        buf[10..14].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[14] = self.flags;
        buf[15] = 0; // reserved
        buf
    }

    /// Parses a header; `lsn` is only used for error reporting.
    pub fn from_bytes(bytes: &[u8], lsn: Lsn) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(LogTreeError::corruption(
                lsn,
                format!("header needs {} bytes, got {}", Self::SIZE, bytes.len()),
            ));
        }

        let entry_type = LogEntryType::from_u8(bytes[4])
            .ok_or_else(|| LogTreeError::corruption(lsn, format!("unknown entry type {}", bytes[4])))?;

        Ok(Self {
            checksum: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            entry_type,
            version: bytes[5],
            prev_offset: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            payload_size: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]),
            flags: bytes[14],
        })
    }

    pub fn compute_checksum(header_bytes: &[u8], payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes[4..Self::SIZE]);
        hasher.update(payload);
        hasher.finalize()
    }

    /// Builds the complete on-disk form of an entry: header with checksum,
    /// then payload.
    pub fn encode_entry(mut self, payload: &[u8]) -> Vec<u8> {
        self.payload_size = payload.len() as u32;
        let mut bytes = Vec::with_capacity(Self::SIZE + payload.len());
        bytes.extend_from_slice(&self.to_bytes());
        let checksum = Self::compute_checksum(&bytes, payload);
        bytes[0..4].copy_from_slice(&checksum.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Checks the stored checksum against the header bytes and payload.
    pub fn verify(&self, header_bytes: &[u8], payload: &[u8], lsn: Lsn) -> Result<()> {
        let computed = Self::compute_checksum(header_bytes, payload);
        if computed != self.checksum {
            return Err(LogTreeError::Checksum {
                lsn,
                stored: self.checksum,
                computed,
            });
        }
        if self.version > LOG_FORMAT_VERSION {
            return Err(LogTreeError::corruption(
                lsn,
                format!("entry version {} is newer than {}", self.version, LOG_FORMAT_VERSION),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = LogEntryHeader::new(LogEntryType::Ln, 0x1234, 0, LogEntryHeader::FLAG_TRANSACTIONAL);
        let bytes = header.encode_entry(b"payload");
        assert_eq!(bytes.len(), LogEntryHeader::SIZE + 7);
        assert_eq!(bytes[4], LogEntryType::Ln as u8);
        assert_eq!(&bytes[6..10], &0x1234u32.to_le_bytes());
        assert_eq!(&bytes[10..14], &7u32.to_le_bytes());

        let parsed = LogEntryHeader::from_bytes(&bytes, Lsn::new(0, 0)).unwrap();
        assert!(parsed.is_transactional());
        assert_eq!(parsed.entry_size(), bytes.len());
        parsed
            .verify(&bytes[..LogEntryHeader::SIZE], &bytes[LogEntryHeader::SIZE..], Lsn::new(0, 0))
            .unwrap();
    }

    #[test]
    fn test_detects_flipped_payload_bit() {
        let header = LogEntryHeader::new(LogEntryType::Trace, 0, 0, 0);
        let mut bytes = header.encode_entry(b"some trace text");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let lsn = Lsn::new(1, 64);
        let parsed = LogEntryHeader::from_bytes(&bytes, lsn).unwrap();
        let result = parsed.verify(&bytes[..LogEntryHeader::SIZE], &bytes[LogEntryHeader::SIZE..], lsn);
        assert!(matches!(result, Err(LogTreeError::Checksum { .. })));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut bytes = [0u8; LogEntryHeader::SIZE];
        bytes[4] = 200;
        assert!(matches!(
            LogEntryHeader::from_bytes(&bytes, Lsn::new(0, 0)),
            Err(LogTreeError::Corruption { .. })
        ));
    }
}
