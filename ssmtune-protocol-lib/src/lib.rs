//! SSM protocol implementation for ECU/TCU communication
//!
//! This library provides the frame codec, typed requests, the byte-level
//! [`Transport`] contract and a request/response [`Protocol`] wrapper, plus a
//! [`SimulatedEcu`] that answers frames for testing and the mock server.

mod codec;
mod device;
mod error;
mod protocol;
mod request;
mod transport;

pub use codec::{
    build_reply, check_frame, checksum, frame_command, is_ack, split_frame, strip_response, Codec,
    Command, Endpoint, Frame, ACK_BIT, FRAME_START, HEADER_LEN, MAX_PAYLOAD_LEN, MIN_RESPONSE_LEN,
    TOOL_ADDRESS,
};
pub use device::{LoopbackTransport, SimulatedEcu};
pub use error::{ProtocolError, TransportError};
pub use protocol::{Identity, Protocol, DEFAULT_TIMEOUT, PROTOCOL_ID};
pub use request::{Request, MAX_ADDRESS, MAX_ADDRESS_READ, MAX_BLOCK_READ, MAX_BLOCK_WRITE};
pub use transport::{TcpTransport, Transport};
