//! On-device layout of the live-tune region.
//!
//! ```text
//! region_start: last_index (u32 BE) | count (u32 BE)
//!               [rom_address (u32 BE) | ram_address (u32 BE)] x count
//!               table data, packed in header order
//! ```
//!
//! The top byte of each RAM address is `0xFF` while the table is active.

use deku::prelude::*;
use log::warn;

/// Set in a header RAM address while the table is active
pub const ACTIVE_FLAG: u32 = 0xFF00_0000;
/// RAM address bits of a header word
pub const ADDRESS_MASK: u32 = 0x00FF_FFFF;
/// `last_index` and `count`
pub const PREFIX_LEN: usize = 8;
/// One ROM/RAM address pair
pub const HEADER_ENTRY_LEN: usize = 8;

/// Header bytes for `count` tables
#[must_use]
pub const fn header_len(count: usize) -> usize {
    PREFIX_LEN + HEADER_ENTRY_LEN * count
}

/// First two words of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct RegionPrefix {
    pub last_index: u32,
    pub count: u32,
}

impl RegionPrefix {
    /// # Errors
    ///
    /// Returns a [`DekuError`] if fewer than [`PREFIX_LEN`] bytes are given.
    pub fn parse(bytes: &[u8]) -> Result<Self, DekuError> {
        let (_rest, prefix) = Self::from_bytes((bytes, 0))?;
        Ok(prefix)
    }

    /// Number of tables the prefix describes.
    ///
    /// A prefix whose words disagree (an uninitialized region) describes no
    /// tables.
    #[must_use]
    pub fn table_count(&self) -> usize {
        if self.count > 0 && self.last_index == self.count - 1 {
            self.count as usize
        } else {
            if self.count != 0 || self.last_index != u32::MAX {
                warn!(
                    "Inconsistent region prefix (last_index {}, count {}), treating region as empty",
                    self.last_index, self.count
                );
            }
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct HeaderEntry {
    pub rom_address: u32,
    /// RAM address with the active flag in the top byte
    pub ram_address: u32,
}

impl HeaderEntry {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.ram_address & ACTIVE_FLAG == ACTIVE_FLAG
    }

    #[must_use]
    pub const fn ram(&self) -> u32 {
        self.ram_address & ADDRESS_MASK
    }
}

/// Prefix plus address table.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct RegionHeader {
    pub last_index: u32,
    pub count: u32,
    #[deku(count = "count")]
    pub entries: Vec<HeaderEntry>,
}

impl RegionHeader {
    #[must_use]
    pub fn new(entries: Vec<HeaderEntry>) -> Self {
        #[allow(clippy::cast_possible_truncation)] // bounded by the region size
        let count = entries.len() as u32;
        Self {
            last_index: count.wrapping_sub(1),
            count,
            entries,
        }
    }

    /// Parse a header from device bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`DekuError`] if the bytes are too short for the count they declare.
    pub fn parse(bytes: &[u8]) -> Result<Self, DekuError> {
        let (_rest, header) = Self::from_bytes((bytes, 0))?;
        Ok(header)
    }

    /// Serialize for writing to the device.
    ///
    /// # Errors
    ///
    /// Returns a [`DekuError`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, DekuError> {
        self.to_bytes()
    }

    #[must_use]
    pub fn rom_addresses(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.rom_address).collect()
    }

    #[must_use]
    pub fn ram_addresses(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.ram_address).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = RegionHeader::new(vec![
            HeaderEntry {
                rom_address: 0x0001_2340,
                ram_address: 0x00FF_A018,
            },
            HeaderEntry {
                rom_address: 0x0001_5000,
                ram_address: 0xFFFF_A058,
            },
        ]);
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), header_len(2));
        assert_eq!(
            bytes,
            vec![
                0, 0, 0, 1, 0, 0, 0, 2, //
                0x00, 0x01, 0x23, 0x40, 0x00, 0xFF, 0xA0, 0x18, //
                0x00, 0x01, 0x50, 0x00, 0xFF, 0xFF, 0xA0, 0x58,
            ]
        );
        assert_eq!(RegionHeader::parse(&bytes).unwrap(), header);
        assert!(!header.entries[0].is_active());
        assert!(header.entries[1].is_active());
        assert_eq!(header.entries[1].ram(), 0xFF_A058);
    }

    #[test]
    fn test_empty_header() {
        let header = RegionHeader::new(Vec::new());
        let bytes = header.encode().unwrap();
        assert_eq!(bytes, vec![0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0]);
        assert_eq!(RegionPrefix::parse(&bytes).unwrap().table_count(), 0);
    }

    #[test]
    fn test_prefix_consistency() {
        let prefix = RegionPrefix::parse(&[0, 0, 0, 2, 0, 0, 0, 3]).unwrap();
        assert_eq!(prefix.table_count(), 3);

        // Zeroed RAM after power-up
        let zeroed = RegionPrefix::parse(&[0; 8]).unwrap();
        assert_eq!(zeroed.table_count(), 0);

        let garbage = RegionPrefix { last_index: 7, count: 3 };
        assert_eq!(garbage.table_count(), 0);
    }

    #[test]
    fn test_truncated_header_fails() {
        let bytes = [0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 0];
        assert!(RegionHeader::parse(&bytes).is_err());
    }
}
