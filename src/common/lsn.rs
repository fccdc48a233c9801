use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Log sequence number: the address of an entry in the log, as the number of
/// the file holding it and the byte offset of the entry header in that file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lsn {
    pub file: u32,
    pub offset: u32,
}

impl Lsn {
    pub const fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    /// Packs the LSN into a single integer with the same ordering.
    pub fn as_u64(&self) -> u64 {
        ((self.file as u64) << 32) | self.offset as u64
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            file: (value >> 32) as u32,
            offset: value as u32,
        }
    }
}

impl Ord for Lsn {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.file.cmp(&other.file) {
            Ordering::Equal => self.offset.cmp(&other.offset),
            other => other,
        }
    }
}

impl PartialOrd for Lsn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}/0x{:x}", self.file, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_orders_by_file_then_offset() {
        assert!(Lsn::new(0, 500) < Lsn::new(1, 0));
        assert!(Lsn::new(3, 10) < Lsn::new(3, 11));
        assert_eq!(Lsn::new(2, 7), Lsn::new(2, 7));
    }

    #[test]
    fn test_display() {
        assert_eq!(Lsn::new(0x1f, 0x200).to_string(), "0x1f/0x200");
    }

    proptest! {
        #[test]
        fn packed_form_preserves_order(a in any::<(u32, u32)>(), b in any::<(u32, u32)>()) {
            let la = Lsn::new(a.0, a.1);
            let lb = Lsn::new(b.0, b.1);
            prop_assert_eq!(la.cmp(&lb), la.as_u64().cmp(&lb.as_u64()));
            prop_assert_eq!(Lsn::from_u64(la.as_u64()), la);
        }
    }
}
