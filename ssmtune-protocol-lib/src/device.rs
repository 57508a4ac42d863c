//! In-memory ECU that answers protocol frames.
//!
//! Used by the mock ECU server and by tests that need a device on the other
//! end of a [`Transport`].

use log::{debug, warn};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::codec::{build_reply, check_frame, Endpoint, Frame, HEADER_LEN, TOOL_ADDRESS};
use crate::error::TransportError;
use crate::request::Request;
use crate::transport::Transport;

/// Simulated device state: identity, sparse memory and any active stream.
#[derive(Debug, Clone)]
pub struct SimulatedEcu {
    endpoint: Endpoint,
    identity: Vec<u8>,
    /// Unset addresses read as zero
    memory: BTreeMap<u32, u8>,
    stream: Option<Request>,
}

impl SimulatedEcu {
    pub fn new(endpoint: Endpoint, identity: Vec<u8>) -> Self {
        Self {
            endpoint,
            identity,
            memory: BTreeMap::new(),
            stream: None,
        }
    }

    /// Protocol id `A2 10 11`, ROM id `4A 12 34 56 78`, then capability bytes
    #[must_use]
    pub fn default_identity() -> Vec<u8> {
        vec![
            0xA2, 0x10, 0x11, 0x4A, 0x12, 0x34, 0x56, 0x78, 0xF3, 0xFA, 0xC9, 0x8E, 0xEB, 0xC0,
        ]
    }

    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Store `bytes` starting at `address`.
    pub fn load(&mut self, address: u32, bytes: &[u8]) {
        for (offset, &byte) in (0u32..).zip(bytes) {
            self.memory.insert(address.wrapping_add(offset), byte);
        }
    }

    #[must_use]
    pub fn peek(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn dump(&self, address: u32, len: usize) -> Vec<u8> {
        (0u32..)
            .take(len)
            .map(|offset| self.peek(address.wrapping_add(offset)))
            .collect()
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Handle one request frame, returning the reply if the device answers.
    ///
    /// Frames with a bad checksum, for another endpoint or with an unknown
    /// command are ignored, like a real device would.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Option<Frame> {
        if let Err(e) = check_frame(frame) {
            warn!("Device ignoring frame {}: {e}", hex::encode(frame));
            return None;
        }
        let destination = Endpoint::from_destination(frame[1])?;
        if frame[2] != TOOL_ADDRESS || !destination.reaches(self.endpoint) {
            debug!("Device {} ignoring frame for {destination}", self.endpoint);
            return None;
        }

        let request = match Request::decode(frame[HEADER_LEN - 1], &frame[HEADER_LEN..frame.len() - 1]) {
            Ok(request) => request,
            Err(e) => {
                warn!("Device ignoring request: {e}");
                return None;
            }
        };

        // Any new request ends a running stream
        self.stream = request.is_continuous().then(|| request.clone());
        self.reply_to(&request)
    }

    /// Next unsolicited reply while a continuous request is active.
    #[must_use]
    pub fn stream_frame(&self) -> Option<Frame> {
        let request = self.stream.as_ref()?;
        let payload = self.read_payload(request);
        build_reply(self.endpoint, request.command().ack(), &payload).ok()
    }

    fn read_payload(&self, request: &Request) -> Vec<u8> {
        match request {
            Request::ReadBlock { address, length, .. } => self.dump(*address, *length),
            Request::ReadAddresses { addresses, .. } => {
                addresses.iter().map(|&a| self.peek(a)).collect()
            }
            _ => Vec::new(),
        }
    }

    fn reply_to(&mut self, request: &Request) -> Option<Frame> {
        let payload = match request {
            Request::Identify => self.identity.clone(),
            Request::ReadBlock { .. } | Request::ReadAddresses { .. } => self.read_payload(request),
            Request::WriteBlock { address, data } => {
                self.load(*address, data);
                data.clone()
            }
            Request::WriteAddress { address, value } => {
                self.load(*address, &[*value]);
                vec![*value]
            }
        };
        build_reply(self.endpoint, request.command().ack(), &payload).ok()
    }
}

/// [`Transport`] wired straight into a [`SimulatedEcu`], no I/O involved.
///
/// Reads never block: a read with nothing queued returns `Ok(None)` at once.
#[derive(Debug)]
pub struct LoopbackTransport {
    ecu: SimulatedEcu,
    inbox: VecDeque<Frame>,
    frames_received: usize,
}

impl LoopbackTransport {
    pub fn new(ecu: SimulatedEcu) -> Self {
        Self {
            ecu,
            inbox: VecDeque::new(),
            frames_received: 0,
        }
    }

    pub const fn ecu(&self) -> &SimulatedEcu {
        &self.ecu
    }

    pub fn ecu_mut(&mut self) -> &mut SimulatedEcu {
        &mut self.ecu
    }

    /// Number of frames written to the device so far
    pub const fn frames_received(&self) -> usize {
        self.frames_received
    }
}

impl Transport for LoopbackTransport {
    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        self.frames_received += 1;
        if let Some(reply) = self.ecu.handle_frame(data) {
            self.inbox.push_back(reply);
        }
        Ok(())
    }

    fn read(
        &mut self,
        max_messages: usize,
        _timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut out = Vec::new();
        for _ in 0..max_messages.max(1) {
            let Some(frame) = self.inbox.pop_front().or_else(|| self.ecu.stream_frame()) else {
                break;
            };
            out.extend_from_slice(&frame);
        }
        Ok((!out.is_empty()).then_some(out))
    }

    fn clear_buffers(&mut self) -> Result<(), TransportError> {
        self.inbox.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{strip_response, Codec};

    fn request_frame(request: &Request) -> Frame {
        Codec::new(Endpoint::Ecu).encode(request).unwrap()
    }

    #[test]
    fn test_block_read_reply() {
        let mut ecu = SimulatedEcu::new(Endpoint::Ecu, SimulatedEcu::default_identity());
        ecu.load(0x20, &[5, 6, 7]);
        let reply = ecu
            .handle_frame(&request_frame(&Request::ReadBlock {
                address: 0x1F,
                length: 5,
                continuous: false,
            }))
            .unwrap();
        assert_eq!(reply[1], TOOL_ADDRESS);
        assert_eq!(reply[2], 0x10);
        assert_eq!(reply[4], 0xE0);
        assert_eq!(strip_response(&reply), Some([0, 5, 6, 7, 0].as_slice()));
        assert!(check_frame(&reply).is_ok());
    }

    #[test]
    fn test_bad_checksum_ignored() {
        let mut ecu = SimulatedEcu::new(Endpoint::Ecu, SimulatedEcu::default_identity());
        let mut frame = request_frame(&Request::Identify);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(ecu.handle_frame(&frame).is_none());
    }

    #[test]
    fn test_stream_stops_on_next_request() {
        let mut ecu = SimulatedEcu::new(Endpoint::Ecu, SimulatedEcu::default_identity());
        ecu.handle_frame(&request_frame(&Request::ReadAddresses {
            addresses: vec![1, 2],
            continuous: true,
        }));
        assert!(ecu.is_streaming());
        assert!(ecu.stream_frame().is_some());

        ecu.handle_frame(&request_frame(&Request::Identify));
        assert!(!ecu.is_streaming());
        assert!(ecu.stream_frame().is_none());
    }

    #[test]
    fn test_both_endpoint_reaches_tcu() {
        let mut tcu = SimulatedEcu::new(Endpoint::Tcu, SimulatedEcu::default_identity());
        let frame = Codec::new(Endpoint::Both).encode(&Request::Identify).unwrap();
        let reply = tcu.handle_frame(&frame).unwrap();
        assert_eq!(reply[2], 0x18);
    }
}
