//! Live-tune RAM region allocator.
//!
//! Tables are staged into two pending sets, then committed in separate
//! phases that each return a [`PatchMap`] for the caller to write. The
//! allocator never touches the device. After a layout or activation commit it
//! forgets everything it knew, and must be re-seeded from device read-backs
//! (`init_table_count`, `init_headers`, `init_tables`) before the next
//! operation.

use derive_more::Display;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::error::AllocatorError;
use crate::patch::PatchMap;
use crate::region::{header_len, HeaderEntry, RegionHeader, ADDRESS_MASK, HEADER_ENTRY_LEN, PREFIX_LEN};
use crate::rom::RomImage;
use crate::table::{RamTable, TableSpec};

/// Offset of the RAM address word inside a header entry
const RAM_WORD_OFFSET: usize = 4;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    #[display("uninitialized")]
    Uninitialized,
    #[display("table-count-known")]
    TableCountKnown,
    #[display("headers-resolved")]
    HeadersResolved,
    #[display("tables-verified")]
    TablesVerified,
}

/// One header slot as read back from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResolvedHeader {
    rom_address: u32,
    /// Word as stored, flag byte included
    raw_ram: u32,
    /// Masked address, `None` if outside the table area
    ram: Option<u32>,
    active: bool,
}

/// Staged allocations and activations by ROM address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub allocation: BTreeSet<u32>,
    pub activation: BTreeSet<u32>,
}

/// A table that will be in the layout after the pending allocation commits
struct Placement {
    rom_address: u32,
    range: Range<usize>,
    added: bool,
}

#[derive(Debug)]
pub struct LiveTuneAllocator {
    region_start: u32,
    /// Exclusive
    region_end: u32,
    state: RegionState,
    table_count: usize,
    headers: Vec<ResolvedHeader>,
    /// Every known table, in canonical packing order
    tables: BTreeMap<u32, RamTable>,
    /// ROM addresses to add (if unallocated) or remove (if allocated)
    pending_allocation: BTreeSet<u32>,
    pending_activation: BTreeSet<u32>,
}

impl LiveTuneAllocator {
    pub fn new(region_start: u32, region_end: u32) -> Self {
        let region_start = region_start & ADDRESS_MASK;
        Self {
            region_start,
            region_end: region_end.max(region_start),
            state: RegionState::Uninitialized,
            table_count: 0,
            headers: Vec::new(),
            tables: BTreeMap::new(),
            pending_allocation: BTreeSet::new(),
            pending_activation: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> RegionState {
        self.state
    }

    #[must_use]
    pub const fn region_start(&self) -> u32 {
        self.region_start
    }

    #[must_use]
    pub const fn region_end(&self) -> u32 {
        self.region_end
    }

    #[must_use]
    pub const fn region_size(&self) -> usize {
        (self.region_end - self.region_start) as usize
    }

    /// Number of header slots on the device
    #[must_use]
    pub const fn table_count(&self) -> usize {
        self.table_count
    }

    /// First byte after the header for the current table count
    #[must_use]
    pub fn table_area_start(&self) -> u32 {
        self.region_start + region_offset(header_len(self.table_count))
    }

    #[must_use]
    pub fn table(&self, rom_address: u32) -> Option<&RamTable> {
        self.tables.get(&rom_address)
    }

    /// All known tables, by ROM address
    pub fn tables(&self) -> impl Iterator<Item = &RamTable> {
        self.tables.values()
    }

    /// Tables with RAM assigned, in packing order
    pub fn allocated(&self) -> impl Iterator<Item = &RamTable> {
        self.tables.values().filter(|t| t.is_allocated())
    }

    #[must_use]
    pub fn is_pending_allocation(&self, rom_address: u32) -> bool {
        self.pending_allocation.contains(&rom_address)
    }

    #[must_use]
    pub fn is_pending_activation(&self, rom_address: u32) -> bool {
        self.pending_activation.contains(&rom_address)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending_allocation.is_empty() || !self.pending_activation.is_empty()
    }

    /// Allocated tables that are not active yet.
    ///
    /// Non-empty between an allocation commit and the matching activation
    /// commit, including after a power cycle in that window. Activation can
    /// be staged for them as usual.
    #[must_use]
    pub fn inactive_tables(&self) -> Vec<u32> {
        self.allocated()
            .filter(|t| !t.is_active())
            .map(RamTable::rom_address)
            .collect()
    }

    #[must_use]
    pub fn is_awaiting_activation(&self) -> bool {
        self.state == RegionState::TablesVerified && !self.inactive_tables().is_empty()
    }

    /// Start over from a prefix read-back: `count` header slots.
    ///
    /// Pending changes are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::IndeterminateState`] if `count` headers do
    /// not fit in the region.
    pub fn init_table_count(&mut self, count: usize) -> Result<(), AllocatorError> {
        self.reset();

        let required = header_len(count);
        if required > self.region_size() {
            return Err(self.indeterminate(format!(
                "{count} header slots need {required} bytes, region holds {}",
                self.region_size()
            )));
        }
        self.table_count = count;
        self.state = RegionState::TableCountKnown;
        debug!("Live-tune region holds {count} tables");
        Ok(())
    }

    /// Pair the header read-back: ROM address and raw RAM word per slot.
    ///
    /// A RAM address outside the table area leaves its table unallocated.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::OutOfSequence`] before `init_table_count`, or
    /// [`AllocatorError::HeaderMismatch`] if the lists do not match the count.
    pub fn init_headers(&mut self, rom_addresses: &[u32], ram_addresses: &[u32]) -> Result<(), AllocatorError> {
        self.expect_state("init_headers", RegionState::TableCountKnown)?;
        if rom_addresses.len() != self.table_count || ram_addresses.len() != self.table_count {
            return Err(AllocatorError::HeaderMismatch {
                expected: self.table_count,
                roms: rom_addresses.len(),
                rams: ram_addresses.len(),
            });
        }

        let area = self.table_area_start()..self.region_end;
        self.headers = rom_addresses
            .iter()
            .zip(ram_addresses)
            .map(|(&rom_address, &raw_ram)| {
                let masked = raw_ram & ADDRESS_MASK;
                let in_area = area.contains(&masked);
                if !in_area {
                    warn!(
                        "Header for table 0x{rom_address:06X} points at 0x{masked:06X}, outside the table area; treating as unallocated"
                    );
                }
                ResolvedHeader {
                    rom_address,
                    raw_ram,
                    ram: in_area.then_some(masked),
                    active: in_area && raw_ram >> 24 == 0xFF,
                }
            })
            .collect();
        self.state = RegionState::HeadersResolved;
        Ok(())
    }

    /// [`Self::init_headers`] from a parsed region header.
    ///
    /// # Errors
    ///
    /// As for [`Self::init_headers`].
    pub fn init_region_header(&mut self, header: &RegionHeader) -> Result<(), AllocatorError> {
        self.init_headers(&header.rom_addresses(), &header.ram_addresses())
    }

    /// Register the table definitions and check the device layout against
    /// the canonical packing.
    ///
    /// Allocated tables are packed by ascending ROM address from the start of
    /// the table area. Any header that disagrees means the device and this
    /// model have diverged.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::IndeterminateState`] on any disagreement (the
    /// allocator is reset), or [`AllocatorError::TableOutOfRom`] for a
    /// definition outside the ROM image.
    pub fn init_tables(&mut self, specs: &[TableSpec], rom: &RomImage) -> Result<(), AllocatorError> {
        self.expect_state("init_tables", RegionState::HeadersResolved)?;

        let mut tables = BTreeMap::new();
        for spec in specs {
            let range = rom.range(spec.rom_address, spec.length)?;
            if tables.contains_key(&spec.rom_address) {
                warn!("Duplicate table definition at 0x{:06X}, keeping the first", spec.rom_address);
                continue;
            }
            tables.insert(
                spec.rom_address,
                RamTable::new(spec.name.clone(), spec.rom_address, range),
            );
        }

        match self.check_layout(&mut tables) {
            Ok(()) => {
                info!(
                    "Live-tune region verified: {} of {} tables allocated",
                    tables.values().filter(|t| t.is_allocated()).count(),
                    tables.len()
                );
                self.tables = tables;
                self.state = RegionState::TablesVerified;
                Ok(())
            }
            Err(reason) => Err(self.indeterminate(reason)),
        }
    }

    fn check_layout(&self, tables: &mut BTreeMap<u32, RamTable>) -> Result<(), String> {
        let mut allocated = BTreeMap::new();
        for header in self.headers.iter().filter(|h| h.ram.is_some()) {
            if !tables.contains_key(&header.rom_address) {
                return Err(format!("device header names unknown table 0x{:06X}", header.rom_address));
            }
            if allocated.insert(header.rom_address, *header).is_some() {
                return Err(format!("table 0x{:06X} is listed twice", header.rom_address));
            }
        }

        let mut cursor = u64::from(self.table_area_start());
        for (rom_address, header) in &allocated {
            let Some(table) = tables.get_mut(rom_address) else {
                continue;
            };
            #[allow(clippy::cast_possible_truncation)] // bounded by region_end below
            let expected = cursor as u32;
            if header.ram != Some(expected) {
                return Err(format!(
                    "table 0x{rom_address:06X} is at 0x{:06X} on the device but packs at 0x{expected:06X}",
                    header.raw_ram & ADDRESS_MASK
                ));
            }
            table.ram_address = Some(expected);
            table.active = header.active;
            cursor += table.len() as u64;
        }
        if cursor > u64::from(self.region_end) {
            return Err(format!("allocated tables end at 0x{cursor:06X}, past the region end"));
        }
        Ok(())
    }

    /// Record the device's bytes for an allocated table.
    ///
    /// # Errors
    ///
    /// Returns an error before verification, for an unknown table, or if the
    /// length does not match.
    pub fn verify_table_bytes(&mut self, rom_address: u32, bytes: &[u8]) -> Result<(), AllocatorError> {
        self.expect_state("verify_table_bytes", RegionState::TablesVerified)?;
        let table = self
            .tables
            .get_mut(&rom_address)
            .ok_or(AllocatorError::UnknownTable { rom_address })?;
        if bytes.len() != table.len() {
            return Err(AllocatorError::LengthMismatch {
                rom_address,
                expected: table.len(),
                actual: bytes.len(),
            });
        }
        table.baseline = Some(bytes.to_vec());
        Ok(())
    }

    /// Toggle a table in or out of the pending layout.
    ///
    /// Returns `false` (and changes nothing) if the region is not verified,
    /// the table is active or pending activation, or adding it would make
    /// the pending tables larger than the region.
    pub fn stage_allocation(&mut self, rom_address: u32) -> bool {
        if self.state != RegionState::TablesVerified {
            debug!("Allocation change refused: region is {}", self.state);
            return false;
        }
        let Some(table) = self.tables.get(&rom_address) else {
            return false;
        };
        if table.is_active() || self.pending_activation.contains(&rom_address) {
            debug!("Allocation change refused: table 0x{rom_address:06X} is active");
            return false;
        }
        if self.pending_allocation.remove(&rom_address) {
            return true;
        }

        if !table.is_allocated() {
            let pending_size: usize =
                self.placements().iter().map(|p| p.range.len()).sum::<usize>() + table.len();
            if pending_size > self.region_size() {
                debug!(
                    "Allocation refused: {pending_size} pending bytes exceed the {} byte region",
                    self.region_size()
                );
                return false;
            }
        }
        self.pending_allocation.insert(rom_address);
        true
    }

    /// Toggle a table's pending activation.
    ///
    /// Returns `false` if the table has no RAM address or is pending removal.
    pub fn stage_activation(&mut self, rom_address: u32) -> bool {
        if self.state != RegionState::TablesVerified {
            return false;
        }
        let Some(table) = self.tables.get(&rom_address) else {
            return false;
        };
        if !table.is_allocated() || self.pending_allocation.contains(&rom_address) {
            debug!("Activation change refused: table 0x{rom_address:06X} has no RAM");
            return false;
        }
        if !self.pending_activation.remove(&rom_address) {
            self.pending_activation.insert(rom_address);
        }
        true
    }

    /// Copy of the staged changes, to carry across a resync
    #[must_use]
    pub fn pending_changes(&self) -> PendingChanges {
        PendingChanges {
            allocation: self.pending_allocation.clone(),
            activation: self.pending_activation.clone(),
        }
    }

    /// Stage `pending` again on a freshly verified region.
    ///
    /// Every change goes through the usual staging checks, so changes that no
    /// longer apply to the new layout are dropped. Returns how many were kept.
    pub fn restage(&mut self, pending: PendingChanges) -> usize {
        let total = pending.allocation.len() + pending.activation.len();
        let kept = pending
            .allocation
            .into_iter()
            .filter(|&rom_address| self.stage_allocation(rom_address))
            .count()
            + pending
                .activation
                .into_iter()
                .filter(|&rom_address| self.stage_activation(rom_address))
                .count();
        if kept < total {
            warn!("Dropped {} staged changes after resync", total - kept);
        }
        kept
    }

    /// Layout after the pending allocation: kept tables plus additions
    fn placements(&self) -> Vec<Placement> {
        self.tables
            .values()
            .filter(|t| t.is_allocated() != self.pending_allocation.contains(&t.rom_address))
            .map(|t| Placement {
                rom_address: t.rom_address,
                range: t.range(),
                added: !t.is_allocated(),
            })
            .collect()
    }

    /// Commit the pending layout.
    ///
    /// Added tables restart from their loaded ROM bytes, every table comes
    /// out inactive, and the patch holds the region prefix plus every byte
    /// that differs from what was read back. The allocator then resets.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::AllocationCapacityExceeded`] if the layout
    /// does not fit; nothing is changed in that case.
    pub fn process_allocation(&mut self, rom: &mut RomImage) -> Result<PatchMap, AllocatorError> {
        self.expect_state("process_allocation", RegionState::TablesVerified)?;

        let placements = self.placements();
        let data_len: usize = placements.iter().map(|p| p.range.len()).sum();
        let required = header_len(placements.len()) + data_len;
        if required > self.region_size() {
            return Err(AllocatorError::AllocationCapacityExceeded {
                required,
                available: self.region_size(),
            });
        }

        for placement in placements.iter().filter(|p| p.added) {
            rom.reset(placement.range.clone());
        }

        let mut cursor = self.region_start + region_offset(header_len(placements.len()));
        let mut entries = Vec::with_capacity(placements.len());
        let mut data = Vec::with_capacity(data_len);
        for placement in &placements {
            entries.push(HeaderEntry {
                rom_address: placement.rom_address,
                ram_address: cursor,
            });
            data.extend_from_slice(rom.bytes(placement.range.clone()));
            cursor += region_offset(placement.range.len());
        }
        let mut image = RegionHeader::new(entries).encode()?;
        image.extend_from_slice(&data);

        let known = self.known_device_image()?;
        let prefix_end = self.region_start + region_offset(PREFIX_LEN);
        let patch: PatchMap = (self.region_start..)
            .zip(image)
            .filter(|(address, byte)| *address < prefix_end || known.get(address) != Some(byte))
            .collect();

        info!(
            "Allocation commit: {} tables in {required} of {} bytes, {} bytes to write",
            placements.len(),
            self.region_size(),
            patch.len()
        );
        self.reset();
        Ok(patch)
    }

    /// Region bytes as last read back: header slots and verified table data
    fn known_device_image(&self) -> Result<PatchMap, AllocatorError> {
        let entries = self
            .headers
            .iter()
            .map(|h| HeaderEntry {
                rom_address: h.rom_address,
                ram_address: h.raw_ram,
            })
            .collect();
        let header = RegionHeader::new(entries).encode()?;
        let mut known: PatchMap = (self.region_start..).zip(header).skip(PREFIX_LEN).collect();

        for table in self.allocated() {
            if let (Some(ram), Some(bytes)) = (table.ram_address, &table.baseline) {
                known.extend((ram..).zip(bytes.iter().copied()));
            }
        }
        Ok(known)
    }

    /// Bytes of allocated tables that differ from their baseline.
    ///
    /// Empty when nothing changed. Does not reset the allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::OutOfSequence`] before verification.
    pub fn process_modification(&self, rom: &RomImage) -> Result<PatchMap, AllocatorError> {
        self.expect_state("process_modification", RegionState::TablesVerified)?;

        let mut patch = PatchMap::new();
        for table in self.allocated() {
            let Some(ram) = table.ram_address else {
                continue;
            };
            let changed = (ram..)
                .zip(table.current(rom).iter().zip(table.baseline(rom)))
                .filter(|(_, (current, baseline))| current != baseline)
                .map(|(address, (&current, _))| (address, current));
            patch.extend(changed);
        }
        if patch.is_empty() {
            debug!("No live-tune table changes");
        }
        Ok(patch)
    }

    /// Flip the active flag of every pending-activation table.
    ///
    /// The patch holds the 4-byte RAM address word of each affected header
    /// slot. The allocator then resets.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::OutOfSequence`] before verification.
    pub fn process_activation(&mut self) -> Result<PatchMap, AllocatorError> {
        self.expect_state("process_activation", RegionState::TablesVerified)?;

        let mut patch = PatchMap::new();
        for rom_address in std::mem::take(&mut self.pending_activation) {
            let Some(slot) = self
                .headers
                .iter()
                .position(|h| h.rom_address == rom_address && h.ram.is_some())
            else {
                warn!("No header slot for table 0x{rom_address:06X}, skipping activation");
                continue;
            };
            let Some(table) = self.tables.get_mut(&rom_address) else {
                continue;
            };
            table.active = !table.active;
            let Some(word) = table.header_word() else {
                continue;
            };
            debug!(
                "Table 0x{rom_address:06X} -> {}",
                if table.active { "active" } else { "inactive" }
            );

            let address = self.region_start
                + region_offset(PREFIX_LEN + HEADER_ENTRY_LEN * slot + RAM_WORD_OFFSET);
            patch.extend((address..).zip(word.to_be_bytes()));
        }
        self.reset();
        Ok(patch)
    }

    fn expect_state(&self, operation: &'static str, expected: RegionState) -> Result<(), AllocatorError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(AllocatorError::OutOfSequence {
                operation,
                expected,
                actual: self.state,
            })
        }
    }

    fn indeterminate(&mut self, reason: String) -> AllocatorError {
        warn!("Live-tune region indeterminate: {reason}");
        self.reset();
        AllocatorError::IndeterminateState { reason }
    }

    /// Forget everything read from the device
    fn reset(&mut self) {
        self.state = RegionState::Uninitialized;
        self.table_count = 0;
        self.headers.clear();
        self.tables.clear();
        self.pending_allocation.clear();
        self.pending_activation.clear();
    }
}

/// Byte offset within the region as an address delta
#[allow(clippy::cast_possible_truncation)] // offsets are bounded by the 24-bit region
const fn region_offset(offset: usize) -> u32 {
    offset as u32
}
