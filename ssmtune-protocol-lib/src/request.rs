//! Typed requests and their payload layouts.

use crate::codec::{Command, Frame, MAX_PAYLOAD_LEN};
use crate::error::ProtocolError;

/// Highest address expressible in the 3-byte address fields
pub const MAX_ADDRESS: u32 = 0x00FF_FFFF;
/// Longest block a single read reply can carry
pub const MAX_BLOCK_READ: usize = MAX_PAYLOAD_LEN;
/// Longest block a single write request can carry (3 address bytes + data)
pub const MAX_BLOCK_WRITE: usize = MAX_PAYLOAD_LEN - 3;
/// Most addresses a single address-list read can carry (flag byte + 3 per address)
pub const MAX_ADDRESS_READ: usize = (MAX_PAYLOAD_LEN - 1) / 3;

const SINGLE_SHOT: u8 = 0x00;
const CONTINUOUS: u8 = 0x01;

/// A request to the device, one variant per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Identify,
    ReadBlock {
        address: u32,
        length: usize,
        continuous: bool,
    },
    ReadAddresses {
        addresses: Vec<u32>,
        continuous: bool,
    },
    WriteBlock {
        address: u32,
        data: Vec<u8>,
    },
    WriteAddress {
        address: u32,
        value: u8,
    },
}

impl Request {
    #[must_use]
    pub const fn command(&self) -> Command {
        match self {
            Self::Identify => Command::Identify,
            Self::ReadBlock { .. } => Command::ReadBlock,
            Self::ReadAddresses { .. } => Command::ReadAddresses,
            Self::WriteBlock { .. } => Command::WriteBlock,
            Self::WriteAddress { .. } => Command::WriteAddress,
        }
    }

    /// Whether the device should keep streaming replies to this request
    #[must_use]
    pub const fn is_continuous(&self) -> bool {
        match self {
            Self::ReadBlock { continuous, .. } | Self::ReadAddresses { continuous, .. } => {
                *continuous
            }
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_read(&self) -> bool {
        matches!(self, Self::ReadBlock { .. } | Self::ReadAddresses { .. })
    }

    /// Number of data bytes an acknowledging reply carries, where known.
    #[must_use]
    pub fn expected_len(&self) -> Option<usize> {
        match self {
            Self::Identify => None,
            Self::ReadBlock { length, .. } => Some(*length),
            Self::ReadAddresses { addresses, .. } => Some(addresses.len()),
            Self::WriteBlock { data, .. } => Some(data.len()),
            Self::WriteAddress { .. } => Some(1),
        }
    }

    /// Serialize the request arguments into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns an error if an address does not fit in 24 bits, a block length
    /// is out of range, or the payload would exceed the frame limit.
    pub fn payload(&self) -> Result<Frame, ProtocolError> {
        let mut payload = Frame::new();
        match self {
            Self::Identify => {}
            Self::ReadBlock {
                address,
                length,
                continuous,
            } => {
                if *length == 0 || *length > MAX_BLOCK_READ {
                    return Err(ProtocolError::InvalidBlockLength {
                        len: *length,
                        max: MAX_BLOCK_READ,
                    });
                }
                payload.push(flag(*continuous));
                push_address(&mut payload, *address)?;
                #[allow(clippy::cast_possible_truncation)] // length <= 254
                payload.push((*length - 1) as u8);
            }
            Self::ReadAddresses {
                addresses,
                continuous,
            } => {
                payload.push(flag(*continuous));
                for &address in addresses {
                    push_address(&mut payload, address)?;
                }
            }
            Self::WriteBlock { address, data } => {
                if data.is_empty() {
                    return Err(ProtocolError::InvalidBlockLength {
                        len: 0,
                        max: MAX_BLOCK_WRITE,
                    });
                }
                push_address(&mut payload, *address)?;
                payload.extend_from_slice(data);
            }
            Self::WriteAddress { address, value } => {
                push_address(&mut payload, *address)?;
                payload.push(*value);
            }
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(payload)
    }

    /// Parse a request from its command byte and payload (device side).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownCommand`] or [`ProtocolError::MalformedFrame`].
    pub fn decode(command: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let command = Command::from_u8(command).ok_or(ProtocolError::UnknownCommand { command })?;
        match command {
            Command::Identify => Ok(Self::Identify),
            Command::ReadBlock => {
                let [mode, a, b, c, len] = payload else {
                    return Err(ProtocolError::MalformedFrame {
                        reason: "block read payload must be 5 bytes",
                    });
                };
                Ok(Self::ReadBlock {
                    address: read_address([*a, *b, *c]),
                    length: usize::from(*len) + 1,
                    continuous: *mode == CONTINUOUS,
                })
            }
            Command::ReadAddresses => {
                let Some((mode, rest)) = payload.split_first() else {
                    return Err(ProtocolError::MalformedFrame {
                        reason: "address read payload is empty",
                    });
                };
                if rest.is_empty() || rest.len() % 3 != 0 {
                    return Err(ProtocolError::MalformedFrame {
                        reason: "address list is not a multiple of 3 bytes",
                    });
                }
                Ok(Self::ReadAddresses {
                    addresses: rest
                        .chunks_exact(3)
                        .map(|c| read_address([c[0], c[1], c[2]]))
                        .collect(),
                    continuous: *mode == CONTINUOUS,
                })
            }
            Command::WriteBlock => {
                if payload.len() < 4 {
                    return Err(ProtocolError::MalformedFrame {
                        reason: "block write carries no data",
                    });
                }
                Ok(Self::WriteBlock {
                    address: read_address([payload[0], payload[1], payload[2]]),
                    data: payload[3..].to_vec(),
                })
            }
            Command::WriteAddress => {
                let [a, b, c, value] = payload else {
                    return Err(ProtocolError::MalformedFrame {
                        reason: "address write payload must be 4 bytes",
                    });
                };
                Ok(Self::WriteAddress {
                    address: read_address([*a, *b, *c]),
                    value: *value,
                })
            }
        }
    }
}

const fn flag(continuous: bool) -> u8 {
    if continuous {
        CONTINUOUS
    } else {
        SINGLE_SHOT
    }
}

fn push_address(buf: &mut Frame, address: u32) -> Result<(), ProtocolError> {
    if address > MAX_ADDRESS {
        return Err(ProtocolError::AddressOutOfRange { address });
    }
    buf.extend_from_slice(&address.to_be_bytes()[1..]);
    Ok(())
}

fn read_address(bytes: [u8; 3]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}
