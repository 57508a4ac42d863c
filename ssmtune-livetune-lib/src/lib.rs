//! Live-tune RAM region management for SSM ECUs
//!
//! [`LiveTuneAllocator`] packs ROM tables into a RAM region and produces the
//! byte patches that change the layout, edit table data, or switch tables
//! on and off. [`LiveTuneSession`] reads the region back from a device to
//! seed the allocator and writes its patches.

mod allocator;
mod config;
mod error;
mod patch;
mod region;
mod rom;
mod session;
mod table;

pub use allocator::{LiveTuneAllocator, PendingChanges, RegionState};
pub use config::{load_tables, LiveTuneConfig, ADDRESS_SPACE_END};
pub use error::{AllocatorError, ConfigError, SessionError};
pub use patch::{apply, plan_writes, PatchMap};
pub use region::{
    header_len, HeaderEntry, RegionHeader, RegionPrefix, ACTIVE_FLAG, ADDRESS_MASK, HEADER_ENTRY_LEN,
    PREFIX_LEN,
};
pub use rom::RomImage;
pub use session::LiveTuneSession;
pub use table::{RamTable, TableSpec};
