use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use log::info;
use ssmtune_livetune_lib::{load_tables, LiveTuneAllocator, LiveTuneConfig, LiveTuneSession, RamTable, RomImage};
use ssmtune_protocol_lib::{Endpoint, Protocol, TcpTransport, Transport, DEFAULT_TIMEOUT};
use std::path::PathBuf;

use crate::parse_address;

#[derive(Args, Debug)]
pub struct LiveTuneArgs {
    /// Table definitions (JSON)
    tables: PathBuf,

    /// ROM image the table definitions refer into
    rom: PathBuf,

    /// Live-tune config (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Show the region layout
    Status,
    /// Toggle tables in or out of the region
    Allocate {
        /// ROM addresses of the tables
        #[arg(value_parser = parse_address, required = true)]
        tables: Vec<u32>,
    },
    /// Toggle tables on or off
    Activate {
        /// ROM addresses of the tables
        #[arg(value_parser = parse_address, required = true)]
        tables: Vec<u32>,
    },
    /// Write bytes into an allocated table
    Set {
        /// ROM address of the table
        #[arg(value_parser = parse_address)]
        table: u32,
        /// Byte offset into the table
        offset: usize,
        /// Bytes to write, as hex
        bytes: String,
    },
}

pub fn run(address: &str, args: &LiveTuneArgs) -> Result<()> {
    let config = args
        .config
        .as_deref()
        .map_or_else(LiveTuneConfig::default, LiveTuneConfig::load_or_default);
    let tables = load_tables(&args.tables)
        .with_context(|| format!("loading tables from {}", args.tables.display()))?;
    let image = std::fs::read(&args.rom).with_context(|| format!("reading ROM image {}", args.rom.display()))?;
    let mut rom = RomImage::new(image);

    let transport =
        TcpTransport::connect(address, DEFAULT_TIMEOUT).with_context(|| format!("connecting to {address}"))?;
    let protocol = Protocol::new(transport, Endpoint::Ecu, DEFAULT_TIMEOUT);
    let mut session = LiveTuneSession::new(protocol, &config, tables);

    perform(&mut session, &mut rom, &args.action)?;
    print_status(session.allocator());
    Ok(())
}

fn perform<T: Transport>(session: &mut LiveTuneSession<T>, rom: &mut RomImage, action: &Action) -> Result<()> {
    session.resync(rom).context("reading live-tune region")?;

    match action {
        Action::Status => {}
        Action::Allocate { tables } => {
            for &table in tables {
                if !session.allocator_mut().stage_allocation(table) {
                    bail!("cannot change the allocation of table 0x{table:06X}");
                }
            }
            let patch = session.commit_allocation(rom).context("committing allocation")?;
            info!("Allocation written, {} bytes", patch.len());
        }
        Action::Activate { tables } => {
            for &table in tables {
                if !session.allocator_mut().stage_activation(table) {
                    bail!("table 0x{table:06X} has no RAM to activate");
                }
            }
            let patch = session.commit_activation(rom).context("committing activation")?;
            info!("Activation written, {} bytes", patch.len());
        }
        Action::Set { table, offset, bytes } => {
            let data = hex::decode(bytes).context("parsing bytes")?;
            let len = session
                .allocator()
                .table(*table)
                .filter(|t| t.is_allocated())
                .map(RamTable::len)
                .ok_or_else(|| anyhow!("table 0x{table:06X} is not allocated"))?;
            if offset + data.len() > len {
                bail!("{} bytes at offset {offset} run past the {len} byte table", data.len());
            }
            let rom_address = table + u32::try_from(*offset).context("offset")?;
            rom.write(rom_address, &data)?;
            let patch = session.commit_modification(rom).context("writing table")?;
            info!("Table updated, {} bytes", patch.len());
        }
    }
    Ok(())
}

fn print_status(allocator: &LiveTuneAllocator) {
    println!(
        "Region 0x{:06X}..0x{:06X} ({} bytes), {}",
        allocator.region_start(),
        allocator.region_end(),
        allocator.region_size(),
        allocator.state()
    );
    for table in allocator.tables() {
        let ram = table
            .ram_address()
            .map_or_else(|| "-".to_string(), |ram| format!("0x{ram:06X}"));
        let status = match (table.is_allocated(), table.is_active()) {
            (false, _) => "unallocated",
            (true, false) => "inactive",
            (true, true) => "active",
        };
        println!(
            "  {:<20} rom 0x{:06X} {:>5} bytes  ram {ram:<8} {status}",
            table.name(),
            table.rom_address(),
            table.len()
        );
    }
    if allocator.is_awaiting_activation() {
        println!("Allocated tables still need activating");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssmtune_livetune_lib::TableSpec;
    use ssmtune_protocol_lib::{LoopbackTransport, SimulatedEcu};

    fn session() -> LiveTuneSession<LoopbackTransport> {
        let ecu = SimulatedEcu::new(Endpoint::Ecu, SimulatedEcu::default_identity());
        let protocol = Protocol::new(LoopbackTransport::new(ecu), Endpoint::Ecu, DEFAULT_TIMEOUT);
        LiveTuneSession::new(
            protocol,
            &LiveTuneConfig::default(),
            vec![TableSpec::new("Fuel", 0x10, 8)],
        )
    }

    #[test]
    fn test_allocate_activate_set() {
        let mut rom = RomImage::new(vec![0x11; 0x40]);
        let mut session = session();

        perform(&mut session, &mut rom, &Action::Allocate { tables: vec![0x10] }).unwrap();
        perform(&mut session, &mut rom, &Action::Activate { tables: vec![0x10] }).unwrap();
        assert!(session.allocator().table(0x10).unwrap().is_active());

        let set = Action::Set {
            table: 0x10,
            offset: 6,
            bytes: "abcd".to_string(),
        };
        perform(&mut session, &mut rom, &set).unwrap();
        let ram = session.allocator().table(0x10).unwrap().ram_address().unwrap();
        let device = session.protocol_mut().transport().ecu().dump(ram, 8);
        assert_eq!(device, vec![0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0xAB, 0xCD]);
    }

    #[test]
    fn test_set_rejects_overrun_and_unallocated() {
        let mut rom = RomImage::new(vec![0; 0x40]);
        let mut session = session();
        let set = Action::Set {
            table: 0x10,
            offset: 0,
            bytes: "00".to_string(),
        };
        assert!(perform(&mut session, &mut rom, &set).is_err());

        perform(&mut session, &mut rom, &Action::Allocate { tables: vec![0x10] }).unwrap();
        let overrun = Action::Set {
            table: 0x10,
            offset: 7,
            bytes: "0000".to_string(),
        };
        assert!(perform(&mut session, &mut rom, &overrun).is_err());
    }

    #[test]
    fn test_activate_unallocated_fails() {
        let mut rom = RomImage::new(vec![0; 0x40]);
        let mut session = session();
        assert!(perform(&mut session, &mut rom, &Action::Activate { tables: vec![0x10] }).is_err());
    }
}
