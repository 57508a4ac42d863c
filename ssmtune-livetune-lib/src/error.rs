use deku::DekuError;
use derive_more::{Display, Error, From};
use ssmtune_protocol_lib::ProtocolError;

use crate::allocator::RegionState;

/// Errors from the live-tune allocator.
#[derive(Debug, Display, Error, From)]
pub enum AllocatorError {
    #[display("{operation} needs the region {expected}, but it is {actual}")]
    OutOfSequence {
        operation: &'static str,
        expected: RegionState,
        actual: RegionState,
    },
    #[display("header read-back has {roms} ROM and {rams} RAM addresses for {expected} tables")]
    HeaderMismatch {
        expected: usize,
        roms: usize,
        rams: usize,
    },
    #[display("allocation needs {required} bytes but the region holds {available}")]
    AllocationCapacityExceeded { required: usize, available: usize },
    #[display("device state is indeterminate, reinitialize: {reason}")]
    IndeterminateState { reason: String },
    #[display("table 0x{rom_address:06X} (+{length}) lies outside the ROM image")]
    TableOutOfRom { rom_address: u32, length: usize },
    #[display("no table at ROM address 0x{rom_address:06X}")]
    UnknownTable { rom_address: u32 },
    #[display("read-back of table 0x{rom_address:06X} has {actual} bytes, expected {expected}")]
    LengthMismatch {
        rom_address: u32,
        expected: usize,
        actual: usize,
    },
    #[display("region header encoding failed: {_0}")]
    #[from]
    Encoding(DekuError),
}

/// Errors from a live-tune session talking to the device.
#[derive(Debug, Display, Error, From)]
pub enum SessionError {
    #[display("{_0}")]
    #[from]
    Protocol(ProtocolError),
    #[display("{_0}")]
    #[from]
    Allocator(AllocatorError),
    #[display("no response reading 0x{address:06X}")]
    NoResponse { address: u32 },
    #[display("read of 0x{address:06X} returned {actual} bytes, expected {expected}")]
    ShortRead {
        address: u32,
        expected: usize,
        actual: usize,
    },
    #[display("write to 0x{address:06X} was not acknowledged")]
    NotAcknowledged { address: u32 },
}

/// Errors loading configuration or table definitions.
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("cannot read config: {_0}")]
    #[from]
    Io(std::io::Error),
    #[display("invalid config JSON: {_0}")]
    #[from]
    Json(serde_json::Error),
}
