//! Frame building and validation.
//!
//! Every frame on the wire has the same shape:
//!
//! ```text
//! 0x80 | dest | src | len | cmd | payload[0..len-1] | checksum
//! ```
//!
//! `len` counts the command byte plus the payload, and the checksum is the
//! 8-bit additive sum of every byte before it.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ProtocolError;
use crate::request::Request;

/// First byte of every frame
pub const FRAME_START: u8 = 0x80;
/// Source byte used by the tool in requests (and destination in replies)
pub const TOOL_ADDRESS: u8 = 0xF0;
/// Start, destination, source, length and command bytes
pub const HEADER_LEN: usize = 5;
/// Shortest response that carries any data: header plus checksum
pub const MIN_RESPONSE_LEN: usize = HEADER_LEN + 1;
/// Largest payload a single length byte can describe (`len = payload + 1`)
pub const MAX_PAYLOAD_LEN: usize = 254;
/// Bit the device sets in the echoed command byte to acknowledge a request
pub const ACK_BIT: u8 = 0x40;

/// Type alias for protocol frames. Most requests fit inline.
pub type Frame = SmallVec<[u8; 32]>;

/// Addressable device on the vehicle bus.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    #[default]
    #[display("ECU")]
    Ecu,
    #[display("TCU")]
    Tcu,
    #[display("ECU+TCU")]
    Both,
}

impl Endpoint {
    /// Destination byte used in request frames
    #[must_use]
    pub const fn destination(self) -> u8 {
        match self {
            Self::Ecu => 0x10,
            Self::Tcu => 0x18,
            Self::Both => 0x1F,
        }
    }

    #[must_use]
    pub const fn from_destination(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::Ecu),
            0x18 => Some(Self::Tcu),
            0x1F => Some(Self::Both),
            _ => None,
        }
    }

    /// Whether a frame addressed to `self` should be answered by `device`.
    #[must_use]
    pub fn reaches(self, device: Self) -> bool {
        self == device || self == Self::Both
    }
}

/// Command bytes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ReadBlock = 0xA0,
    ReadAddresses = 0xA8,
    WriteBlock = 0xB0,
    WriteAddress = 0xB8,
    Identify = 0xBF,
}

impl Command {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xA0 => Some(Self::ReadBlock),
            0xA8 => Some(Self::ReadAddresses),
            0xB0 => Some(Self::WriteBlock),
            0xB8 => Some(Self::WriteAddress),
            0xBF => Some(Self::Identify),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Command byte the device echoes back in an acknowledging reply
    #[must_use]
    pub const fn ack(self) -> u8 {
        self as u8 ^ ACK_BIT
    }

    /// Human-readable label for logging
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ReadBlock => "block read",
            Self::ReadAddresses => "address read",
            Self::WriteBlock => "block write",
            Self::WriteAddress => "address write",
            Self::Identify => "identify",
        }
    }
}

/// 8-bit additive checksum over `bytes`
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Whether `response_command` acknowledges `request_command`.
#[must_use]
pub const fn is_ack(request_command: u8, response_command: u8) -> bool {
    request_command ^ response_command == ACK_BIT
}

/// Command byte of a frame, if it is long enough to have one
#[must_use]
pub fn frame_command(frame: &[u8]) -> Option<u8> {
    frame.get(HEADER_LEN - 1).copied()
}

/// Strip the 5 header bytes and the trailing checksum from a response.
///
/// Returns `None` for anything shorter than [`MIN_RESPONSE_LEN`]; callers
/// treat that exactly like a timeout.
#[must_use]
pub fn strip_response(response: &[u8]) -> Option<&[u8]> {
    if response.len() < MIN_RESPONSE_LEN {
        return None;
    }
    Some(&response[HEADER_LEN..response.len() - 1])
}

/// Total length of the frame starting at `buf[0]`, once its length byte has
/// arrived.
#[must_use]
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    let len = *buf.get(3)?;
    Some(HEADER_LEN - 1 + usize::from(len) + 1)
}

/// Split the first complete frame off the front of `buf`.
///
/// Bytes before the next `0x80` start marker are skipped. Returns the frame
/// and the number of bytes consumed, or `None` if no complete frame is
/// buffered yet.
#[must_use]
pub fn split_frame(buf: &[u8]) -> Option<(&[u8], usize)> {
    let start = buf.iter().position(|&b| b == FRAME_START)?;
    let rest = &buf[start..];
    let total = frame_len(rest)?;
    if rest.len() < total {
        return None;
    }
    Some((&rest[..total], start + total))
}

/// Check start byte, length byte and checksum of a complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedFrame`] describing the first problem found.
pub fn check_frame(frame: &[u8]) -> Result<(), ProtocolError> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(ProtocolError::MalformedFrame { reason: "frame too short" });
    }
    if frame[0] != FRAME_START {
        return Err(ProtocolError::MalformedFrame { reason: "missing start byte" });
    }
    if frame_len(frame) != Some(frame.len()) {
        return Err(ProtocolError::MalformedFrame { reason: "length byte mismatch" });
    }
    let (body, sum) = frame.split_at(frame.len() - 1);
    if checksum(body) != sum[0] {
        return Err(ProtocolError::MalformedFrame { reason: "bad checksum" });
    }
    Ok(())
}

fn assemble(destination: u8, source: u8, command: u8, payload: &[u8]) -> Result<Frame, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut frame = Frame::with_capacity(HEADER_LEN + payload.len() + 1);
    #[allow(clippy::cast_possible_truncation)] // payload.len() <= 254
    let len = (payload.len() + 1) as u8;
    frame.extend_from_slice(&[FRAME_START, destination, source, len, command]);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    Ok(frame)
}

/// Build the reply frame a device on `source` sends back to the tool.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if `payload` exceeds [`MAX_PAYLOAD_LEN`].
pub fn build_reply(source: Endpoint, command: u8, payload: &[u8]) -> Result<Frame, ProtocolError> {
    assemble(TOOL_ADDRESS, source.destination(), command, payload)
}

/// Stateless apart from the selected endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Codec {
    endpoint: Endpoint,
}

impl Codec {
    #[must_use]
    pub const fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    #[must_use]
    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint = endpoint;
    }

    /// Build a request frame with an arbitrary command byte.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if `payload` exceeds [`MAX_PAYLOAD_LEN`].
    pub fn build_frame(&self, command: u8, payload: &[u8]) -> Result<Frame, ProtocolError> {
        assemble(self.endpoint.destination(), TOOL_ADDRESS, command, payload)
    }

    /// Encode a typed request into a frame.
    ///
    /// # Errors
    ///
    /// Propagates argument validation errors from [`Request::payload`].
    pub fn encode(&self, request: &Request) -> Result<Frame, ProtocolError> {
        let payload = request.payload()?;
        self.build_frame(request.command().as_u8(), &payload)
    }

    /// Validate a response against the command that was sent.
    ///
    /// Returns the stripped payload, or `None` if the response is too short
    /// or does not acknowledge `request_command`. Mismatches are dropped,
    /// not raised.
    #[must_use]
    pub fn validate<'a>(&self, request_command: u8, response: &'a [u8]) -> Option<&'a [u8]> {
        let payload = strip_response(response)?;
        let response_command = frame_command(response)?;
        if is_ack(request_command, response_command) {
            Some(payload)
        } else {
            log::debug!(
                "Dropping response 0x{response_command:02X} to request 0x{request_command:02X}"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_byte_sum() {
        let codec = Codec::new(Endpoint::Ecu);
        let payload = [0x00, 0x00, 0x10, 0x00, 0x03];
        let frame = codec.build_frame(0xA0, &payload).unwrap();
        let (body, sum) = frame.split_at(frame.len() - 1);
        let expected = body.iter().map(|&b| u32::from(b)).sum::<u32>() % 256;
        assert_eq!(u32::from(sum[0]), expected);
        assert!(check_frame(&frame).is_ok());
    }

    #[test]
    fn test_build_then_strip_recovers_payload() {
        let codec = Codec::new(Endpoint::Tcu);
        let payload: Vec<u8> = (0..=200).collect();
        let frame = codec.build_frame(0xB0, &payload).unwrap();
        assert_eq!(frame[0], FRAME_START);
        assert_eq!(frame[1], 0x18);
        assert_eq!(frame[2], TOOL_ADDRESS);
        assert_eq!(usize::from(frame[3]), payload.len() + 1);
        assert_eq!(frame[4], 0xB0);
        assert_eq!(strip_response(&frame), Some(payload.as_slice()));
    }

    #[test]
    fn test_payload_limit() {
        let codec = Codec::default();
        assert!(codec.build_frame(0xB0, &[0u8; MAX_PAYLOAD_LEN]).is_ok());
        let err = codec.build_frame(0xB0, &[0u8; MAX_PAYLOAD_LEN + 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { len: 255, max: 254 }));
    }

    #[test]
    fn test_ack_rule() {
        assert!(is_ack(0xA0, 0xE0));
        for response in 0..=u8::MAX {
            if response != 0xE0 {
                assert!(!is_ack(0xA0, response), "0x{response:02X} must not ack 0xA0");
            }
        }
        assert_eq!(Command::Identify.ack(), 0xFF);
        assert_eq!(Command::WriteAddress.ack(), 0xF8);
    }

    #[test]
    fn test_block_read_frame_on_ecu() {
        let codec = Codec::new(Endpoint::Ecu);
        let request = Request::ReadBlock {
            address: 0x1000,
            length: 4,
            continuous: false,
        };
        let frame = codec.encode(&request).unwrap();
        assert_eq!(&frame[..], &[0x80, 0x10, 0xF0, 0x06, 0xA0, 0x00, 0x00, 0x10, 0x00, 0x03, 0x39]);
    }

    #[test]
    fn test_strip_nine_byte_response() {
        let response = [0x80, 0xF0, 0x10, 0x04, 0xE0, 0x11, 0x22, 0x33, 0x00];
        assert_eq!(strip_response(&response), Some([0x11, 0x22, 0x33].as_slice()));
    }

    #[test]
    fn test_short_response_is_no_data() {
        assert_eq!(strip_response(&[0x80, 0xF0, 0x10, 0x01, 0xE0]), None);
        let codec = Codec::default();
        assert_eq!(codec.validate(0xA0, &[0x80, 0xF0]), None);
    }

    #[test]
    fn test_validate_drops_mismatched_command() {
        let codec = Codec::default();
        let reply = build_reply(Endpoint::Ecu, 0xE8, &[0x42]).unwrap();
        assert_eq!(codec.validate(0xA0, &reply), None);
        assert_eq!(codec.validate(0xA8, &reply), Some([0x42].as_slice()));
    }

    #[test]
    fn test_split_frame_skips_noise() {
        let reply = build_reply(Endpoint::Ecu, 0xE0, &[1, 2, 3]).unwrap();
        let mut buf = vec![0x00, 0x13];
        buf.extend_from_slice(&reply);
        buf.extend_from_slice(&reply[..4]);
        let (frame, consumed) = split_frame(&buf).unwrap();
        assert_eq!(frame, &reply[..]);
        assert_eq!(consumed, 2 + reply.len());
        assert!(split_frame(&buf[consumed..]).is_none());
    }

    #[test]
    fn test_check_frame_rejects_bad_checksum() {
        let mut reply = build_reply(Endpoint::Ecu, 0xE0, &[1, 2, 3]).unwrap();
        let last = reply.len() - 1;
        reply[last] = reply[last].wrapping_add(1);
        assert!(matches!(
            check_frame(&reply),
            Err(ProtocolError::MalformedFrame { reason: "bad checksum" })
        ));
    }

    #[test]
    fn test_endpoint_destinations() {
        assert_eq!(Endpoint::Ecu.destination(), 0x10);
        assert_eq!(Endpoint::Tcu.destination(), 0x18);
        assert_eq!(Endpoint::from_destination(0x18), Some(Endpoint::Tcu));
        assert!(Endpoint::Both.reaches(Endpoint::Tcu));
        assert!(!Endpoint::Ecu.reaches(Endpoint::Tcu));
    }
}
