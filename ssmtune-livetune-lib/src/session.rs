//! Drives a [`LiveTuneAllocator`] against a device.
//!
//! The allocator only produces patches. The session reads the region back to
//! seed it, writes its patches, and reads back again after every commit so
//! the allocator's view always comes from the device.

use log::{debug, info};
use ssmtune_protocol_lib::{Protocol, Request, Transport, MAX_BLOCK_READ, MAX_BLOCK_WRITE};

use crate::allocator::LiveTuneAllocator;
use crate::config::LiveTuneConfig;
use crate::error::{AllocatorError, SessionError};
use crate::patch::{plan_writes, PatchMap};
use crate::region::{header_len, RegionHeader, RegionPrefix, PREFIX_LEN};
use crate::rom::RomImage;
use crate::table::TableSpec;

pub struct LiveTuneSession<T> {
    protocol: Protocol<T>,
    allocator: LiveTuneAllocator,
    tables: Vec<TableSpec>,
}

impl<T: Transport> LiveTuneSession<T> {
    pub fn new(protocol: Protocol<T>, config: &LiveTuneConfig, tables: Vec<TableSpec>) -> Self {
        Self {
            protocol,
            allocator: LiveTuneAllocator::new(config.region_start, config.region_end),
            tables,
        }
    }

    pub const fn allocator(&self) -> &LiveTuneAllocator {
        &self.allocator
    }

    /// For staging changes
    pub fn allocator_mut(&mut self) -> &mut LiveTuneAllocator {
        &mut self.allocator
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn protocol_mut(&mut self) -> &mut Protocol<T> {
        &mut self.protocol
    }

    pub fn into_protocol(self) -> Protocol<T> {
        self.protocol
    }

    /// Re-seed the allocator from the device: prefix, header, then the bytes
    /// of every allocated table.
    ///
    /// # Errors
    ///
    /// Returns an error if a read fails or the device layout cannot be
    /// reconciled with the table definitions.
    pub fn resync(&mut self, rom: &RomImage) -> Result<(), SessionError> {
        let start = self.allocator.region_start();
        let prefix = RegionPrefix::parse(&self.read_exact(start, PREFIX_LEN)?).map_err(AllocatorError::from)?;
        let count = prefix.table_count();
        self.allocator.init_table_count(count)?;

        let header = if count == 0 {
            RegionHeader::new(Vec::new())
        } else {
            let bytes = self.read_exact(start, header_len(count))?;
            RegionHeader::parse(&bytes).map_err(AllocatorError::from)?
        };
        self.allocator.init_region_header(&header)?;
        self.allocator.init_tables(&self.tables, rom)?;

        let allocated: Vec<_> = self
            .allocator
            .allocated()
            .filter_map(|t| t.ram_address().map(|ram| (t.rom_address(), ram, t.len())))
            .collect();
        for (rom_address, ram, len) in allocated {
            let bytes = self.read_exact(ram, len)?;
            self.allocator.verify_table_bytes(rom_address, &bytes)?;
        }
        info!(
            "Resynced live-tune region: {count} tables, {} inactive",
            self.allocator.inactive_tables().len()
        );
        Ok(())
    }

    /// Read `len` bytes in block-read sized chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if any chunk goes unanswered or comes back short.
    pub fn read_exact(&mut self, address: u32, len: usize) -> Result<Vec<u8>, SessionError> {
        let mut bytes = Vec::with_capacity(len);
        while bytes.len() < len {
            #[allow(clippy::cast_possible_truncation)] // len is bounded by the region
            let chunk_address = address + bytes.len() as u32;
            let chunk_len = (len - bytes.len()).min(MAX_BLOCK_READ);
            let chunk = self
                .protocol
                .read_block(chunk_address, chunk_len)?
                .ok_or(SessionError::NoResponse {
                    address: chunk_address,
                })?;
            if chunk.len() != chunk_len {
                return Err(SessionError::ShortRead {
                    address: chunk_address,
                    expected: chunk_len,
                    actual: chunk.len(),
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    /// Write a patch. Returns the number of write requests sent.
    ///
    /// # Errors
    ///
    /// Returns an error on the first write the device does not acknowledge.
    pub fn push(&mut self, patch: &PatchMap) -> Result<usize, SessionError> {
        let requests = plan_writes(patch, MAX_BLOCK_WRITE);
        for request in &requests {
            let address = match request {
                Request::WriteBlock { address, .. } | Request::WriteAddress { address, .. } => *address,
                _ => continue,
            };
            if self.protocol.execute(request)?.is_none() {
                return Err(SessionError::NotAcknowledged { address });
            }
        }
        debug!("Wrote {} bytes in {} requests", patch.len(), requests.len());
        Ok(requests.len())
    }

    /// Commit the pending layout, write it and read the region back.
    ///
    /// If the write fails part way the allocator is left uninitialized and
    /// must be resynced.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator rejects the layout or the device
    /// I/O fails.
    pub fn commit_allocation(&mut self, rom: &mut RomImage) -> Result<PatchMap, SessionError> {
        let patch = self.allocator.process_allocation(rom)?;
        self.push(&patch)?;
        self.resync(rom)?;
        Ok(patch)
    }

    /// Write edited table bytes and read them back.
    ///
    /// Staged allocations and activations are carried across the read-back
    /// as long as they still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is not verified or the device I/O fails.
    pub fn commit_modification(&mut self, rom: &RomImage) -> Result<PatchMap, SessionError> {
        let patch = self.allocator.process_modification(rom)?;
        if !patch.is_empty() {
            let pending = self.allocator.pending_changes();
            self.push(&patch)?;
            self.resync(rom)?;
            self.allocator.restage(pending);
        }
        Ok(patch)
    }

    /// Flip the pending activations and read the region back.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is not verified or the device I/O fails.
    pub fn commit_activation(&mut self, rom: &RomImage) -> Result<PatchMap, SessionError> {
        let patch = self.allocator.process_activation()?;
        self.push(&patch)?;
        self.resync(rom)?;
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RegionState;
    use crate::region::ACTIVE_FLAG;
    use ssmtune_protocol_lib::{Endpoint, LoopbackTransport, SimulatedEcu};
    use std::time::Duration;

    const START: u32 = 0xFF_A000;
    const END: u32 = 0xFF_A200;

    #[allow(clippy::cast_possible_truncation)]
    fn rom() -> RomImage {
        RomImage::new((0..0x800u32).map(|i| (i * 7) as u8).collect())
    }

    fn session() -> LiveTuneSession<LoopbackTransport> {
        let ecu = SimulatedEcu::new(Endpoint::Ecu, SimulatedEcu::default_identity());
        let protocol = Protocol::new(
            LoopbackTransport::new(ecu),
            Endpoint::Ecu,
            Duration::from_millis(50),
        );
        let config = LiveTuneConfig {
            region_start: START,
            region_end: END,
        };
        let tables = vec![
            TableSpec::new("Fuel", 0x100, 16),
            TableSpec::new("Timing", 0x200, 8),
            TableSpec::new("Idle", 0x300, 300),
        ];
        LiveTuneSession::new(protocol, &config, tables)
    }

    fn device(session: &LiveTuneSession<LoopbackTransport>, address: u32, len: usize) -> Vec<u8> {
        session.protocol.transport().ecu().dump(address, len)
    }

    #[test]
    fn test_resync_zeroed_region() {
        let rom = rom();
        let mut session = session();
        session.resync(&rom).unwrap();
        assert_eq!(session.allocator().state(), RegionState::TablesVerified);
        assert_eq!(session.allocator().allocated().count(), 0);
    }

    #[test]
    fn test_full_cycle() {
        let mut rom = rom();
        let mut session = session();
        session.resync(&rom).unwrap();

        assert!(session.allocator_mut().stage_allocation(0x100));
        assert!(session.allocator_mut().stage_allocation(0x200));
        session.commit_allocation(&mut rom).unwrap();

        assert_eq!(device(&session, START, 8), vec![0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(device(&session, START + 24, 16), rom.bytes(0x100..0x110));
        assert!(session.allocator().is_awaiting_activation());
        assert_eq!(session.allocator().table(0x200).unwrap().ram_address(), Some(START + 40));

        assert!(session.allocator_mut().stage_activation(0x100));
        session.commit_activation(&rom).unwrap();
        assert_eq!(device(&session, START + 12, 4), ((START + 24) | ACTIVE_FLAG).to_be_bytes());
        assert!(session.allocator().table(0x100).unwrap().is_active());
        assert_eq!(session.allocator().inactive_tables(), vec![0x200]);

        rom.write(0x104, &[0x5A, 0xA5]).unwrap();
        let patch = session.commit_modification(&rom).unwrap();
        assert_eq!(patch.len(), 2);
        assert_eq!(device(&session, START + 24 + 4, 2), vec![0x5A, 0xA5]);
        assert!(session.commit_modification(&rom).unwrap().is_empty());
    }

    #[test]
    fn test_modification_keeps_staged_changes() {
        let mut rom = rom();
        let mut session = session();
        session.resync(&rom).unwrap();
        assert!(session.allocator_mut().stage_allocation(0x100));
        assert!(session.allocator_mut().stage_allocation(0x200));
        session.commit_allocation(&mut rom).unwrap();

        assert!(session.allocator_mut().stage_activation(0x200));
        assert!(session.allocator_mut().stage_allocation(0x300));
        rom.write(0x100, &[0xC3]).unwrap();
        assert_eq!(session.commit_modification(&rom).unwrap().len(), 1);

        let allocator = session.allocator();
        assert_eq!(allocator.state(), RegionState::TablesVerified);
        assert!(allocator.is_pending_activation(0x200));
        assert!(allocator.is_pending_allocation(0x300));

        session.commit_activation(&rom).unwrap();
        assert!(session.allocator().table(0x200).unwrap().is_active());
        assert!(!session.allocator().has_pending());
    }

    #[test]
    fn test_large_table_is_read_in_chunks() {
        let mut rom = rom();
        let mut session = session();
        session.resync(&rom).unwrap();
        assert!(session.allocator_mut().stage_allocation(0x300));
        session.commit_allocation(&mut rom).unwrap();

        let table = session.allocator().table(0x300).unwrap();
        assert_eq!(table.ram_address(), Some(START + 16));
        assert!(table.has_read_back());
        assert_eq!(table.baseline(&rom), rom.bytes(0x300..0x300 + 300));
    }

    #[test]
    fn test_resync_picks_up_existing_layout() {
        let rom = rom();
        let mut session = session();
        let header = RegionHeader::new(vec![crate::region::HeaderEntry {
            rom_address: 0x200,
            ram_address: (START + 16) | ACTIVE_FLAG,
        }])
        .encode()
        .unwrap();
        let ecu = session.protocol_mut().transport_mut().ecu_mut();
        ecu.load(START, &header);
        ecu.load(START + 16, &[9; 8]);

        session.resync(&rom).unwrap();
        let table = session.allocator().table(0x200).unwrap();
        assert!(table.is_active());
        assert_eq!(table.baseline(&rom), &[9; 8]);
        // Device differs from the ROM, so the next modification restores it
        assert_eq!(session.allocator().process_modification(&rom).unwrap().len(), 8);
    }

    #[test]
    fn test_misplaced_table_is_indeterminate() {
        let rom = rom();
        let mut session = session();
        let header = RegionHeader::new(vec![crate::region::HeaderEntry {
            rom_address: 0x200,
            ram_address: START + 20,
        }])
        .encode()
        .unwrap();
        session.protocol_mut().transport_mut().ecu_mut().load(START, &header);

        assert!(matches!(
            session.resync(&rom),
            Err(SessionError::Allocator(AllocatorError::IndeterminateState { .. }))
        ));
        assert_eq!(session.allocator().state(), RegionState::Uninitialized);
    }
}
