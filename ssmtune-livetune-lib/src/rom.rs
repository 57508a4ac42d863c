use std::ops::Range;

use crate::error::AllocatorError;

/// Loaded ROM image: the bytes being edited plus the bytes as loaded.
///
/// Tables refer into it by index range rather than holding their own copies.
/// ROM addresses are offsets into the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomImage {
    current: Vec<u8>,
    original: Vec<u8>,
}

impl RomImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            original: bytes.clone(),
            current: bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.current.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Index range of `length` bytes at `rom_address`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::TableOutOfRom`] if the range is not inside the image.
    pub fn range(&self, rom_address: u32, length: usize) -> Result<Range<usize>, AllocatorError> {
        let start = rom_address as usize;
        match start.checked_add(length) {
            Some(end) if end <= self.current.len() => Ok(start..end),
            _ => Err(AllocatorError::TableOutOfRom { rom_address, length }),
        }
    }

    #[must_use]
    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.current[range]
    }

    pub fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.current[range]
    }

    #[must_use]
    pub fn original(&self, range: Range<usize>) -> &[u8] {
        &self.original[range]
    }

    /// Restore a range to its loaded contents.
    pub fn reset(&mut self, range: Range<usize>) {
        self.current[range.clone()].copy_from_slice(&self.original[range]);
    }

    /// Overwrite bytes at `rom_address`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::TableOutOfRom`] if the write runs past the image.
    pub fn write(&mut self, rom_address: u32, data: &[u8]) -> Result<(), AllocatorError> {
        let range = self.range(rom_address, data.len())?;
        self.current[range].copy_from_slice(data);
        Ok(())
    }

    #[must_use]
    pub fn is_modified(&self, range: Range<usize>) -> bool {
        self.current[range.clone()] != self.original[range]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.current
    }
}
