use derive_more::{Display, Error, From};

/// Errors raised by a [`Transport`](crate::Transport) implementation.
///
/// A read that simply times out is not an error; transports report it as
/// `Ok(None)`.
#[derive(Debug, Display, Error, From)]
pub enum TransportError {
    #[display("I/O error: {_0}")]
    #[from]
    Io(std::io::Error),
    #[display("transport disconnected")]
    Disconnected,
}

/// Errors from building, parsing or exchanging protocol frames.
#[derive(Debug, Display, Error, From)]
pub enum ProtocolError {
    #[display("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[display("block length {len} outside 1..={max}")]
    InvalidBlockLength { len: usize, max: usize },
    #[display("address 0x{address:08X} does not fit in 24 bits")]
    AddressOutOfRange { address: u32 },
    #[display("{kind} cannot be used as a polling query")]
    NotAQuery { kind: &'static str },
    #[display("unknown command byte 0x{command:02X}")]
    UnknownCommand { command: u8 },
    #[display("malformed frame: {reason}")]
    MalformedFrame { reason: &'static str },
    #[display("transport error: {_0}")]
    #[from]
    Transport(TransportError),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(TransportError::Io(e))
    }
}
