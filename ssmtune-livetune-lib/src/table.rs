use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::region::ACTIVE_FLAG;
use crate::rom::RomImage;

/// A live-tunable table as defined for the ROM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub rom_address: u32,
    pub length: usize,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, rom_address: u32, length: usize) -> Self {
        Self {
            name: name.into(),
            rom_address,
            length,
        }
    }
}

/// A table in the allocator's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamTable {
    pub(crate) name: String,
    pub(crate) rom_address: u32,
    /// Masked 24-bit RAM address, `None` while unallocated
    pub(crate) ram_address: Option<u32>,
    /// Bytes of this table inside the [`RomImage`]
    pub(crate) range: Range<usize>,
    /// Last device read-back
    pub(crate) baseline: Option<Vec<u8>>,
    pub(crate) active: bool,
}

impl RamTable {
    pub(crate) fn new(name: String, rom_address: u32, range: Range<usize>) -> Self {
        Self {
            name,
            rom_address,
            ram_address: None,
            range,
            baseline: None,
            active: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn rom_address(&self) -> u32 {
        self.rom_address
    }

    #[must_use]
    pub const fn ram_address(&self) -> Option<u32> {
        self.ram_address
    }

    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.ram_address.is_some()
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Bytes as currently edited
    #[must_use]
    pub fn current<'a>(&self, rom: &'a RomImage) -> &'a [u8] {
        rom.bytes(self.range.clone())
    }

    /// Last known device bytes, or the loaded ROM bytes if never read back
    #[must_use]
    pub fn baseline<'a>(&'a self, rom: &'a RomImage) -> &'a [u8] {
        match &self.baseline {
            Some(bytes) => bytes,
            None => rom.original(self.range.clone()),
        }
    }

    #[must_use]
    pub const fn has_read_back(&self) -> bool {
        self.baseline.is_some()
    }

    /// RAM header word: address with the top byte set while active
    #[must_use]
    pub fn header_word(&self) -> Option<u32> {
        self.ram_address
            .map(|ram| if self.active { ram | ACTIVE_FLAG } else { ram })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_falls_back_to_original() {
        let mut rom = RomImage::new(vec![1, 2, 3, 4]);
        let mut table = RamTable::new("Fuel".to_string(), 1, 1..3);
        rom.write(1, &[9, 9]).unwrap();
        assert_eq!(table.current(&rom), &[9, 9]);
        assert_eq!(table.baseline(&rom), &[2, 3]);

        table.baseline = Some(vec![7, 7]);
        assert_eq!(table.baseline(&rom), &[7, 7]);
    }

    #[test]
    fn test_header_word() {
        let mut table = RamTable::new("Fuel".to_string(), 0, 0..4);
        assert_eq!(table.header_word(), None);
        table.ram_address = Some(0xFF_A018);
        assert_eq!(table.header_word(), Some(0x00FF_A018));
        table.active = true;
        assert_eq!(table.header_word(), Some(0xFFFF_A018));
    }
}
