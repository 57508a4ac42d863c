//! Request/response exchange over a [`Transport`].

use log::{debug, info, warn};
use std::time::Duration;

use crate::codec::{Codec, Endpoint};
use crate::error::ProtocolError;
use crate::request::Request;
use crate::transport::Transport;

/// Protocol identifier reported alongside device identities
pub const PROTOCOL_ID: &str = "SSM";

/// Default time to wait for a reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Frames drained while waiting for an interrupt to take effect
const INTERRUPT_DRAIN_LIMIT: usize = 16;
const INTERRUPT_TIMEOUT: Duration = Duration::from_millis(250);
/// Wait for frames already in flight once draining has started
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Device identity returned by the identify command.
///
/// The reply carries a 3-byte protocol identifier, a 5-byte ROM identifier
/// and a capability bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub endpoint: Endpoint,
    /// ROM identifier as uppercase hex, e.g. `"4A12345678"`
    pub identifier: String,
    pub raw: Vec<u8>,
}

impl Identity {
    #[must_use]
    pub fn parse(endpoint: Endpoint, raw: &[u8]) -> Self {
        let identifier = match raw.get(3..8) {
            Some(rom_id) => hex::encode_upper(rom_id),
            None => hex::encode_upper(raw),
        };
        Self {
            endpoint,
            identifier,
            raw: raw.to_vec(),
        }
    }

    /// Capability bytes following the ROM identifier
    #[must_use]
    pub fn capabilities(&self) -> &[u8] {
        self.raw.get(8..).unwrap_or_default()
    }
}

/// Codec plus transport: owns the link to one device.
pub struct Protocol<T> {
    codec: Codec,
    transport: T,
    timeout: Duration,
}

impl<T: Transport> Protocol<T> {
    pub fn new(transport: T, endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            codec: Codec::new(endpoint),
            transport,
            timeout,
        }
    }

    pub const fn codec(&self) -> &Codec {
        &self.codec
    }

    pub const fn endpoint(&self) -> Endpoint {
        self.codec.endpoint()
    }

    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        info!("Switching endpoint to {endpoint}");
        self.codec.set_endpoint(endpoint);
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Execute a request.
    ///
    /// Continuous requests are written without waiting and return `Ok(None)`;
    /// replies are drained later with [`Protocol::poll`]. Otherwise returns the
    /// acknowledged payload, or `Ok(None)` on timeout or a mismatched reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be encoded or the transport fails.
    pub fn execute(&mut self, request: &Request) -> Result<Option<Vec<u8>>, ProtocolError> {
        let frame = self.codec.encode(request)?;
        let command = request.command();
        debug!("{} -> {}", command.label(), hex::encode(&frame));

        if request.is_continuous() {
            self.transport.write(&frame, self.timeout)?;
            return Ok(None);
        }

        let Some(response) = self.transport.query(&frame, self.timeout)? else {
            debug!("{} timed out", command.label());
            return Ok(None);
        };
        Ok(self
            .codec
            .validate(command.as_u8(), &response)
            .map(<[u8]>::to_vec))
    }

    /// Write a request without waiting for its reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be encoded or the transport fails.
    pub fn send(&mut self, request: &Request) -> Result<(), ProtocolError> {
        let frame = self.codec.encode(request)?;
        debug!("{} -> {} (no wait)", request.command().label(), hex::encode(&frame));
        self.transport.write(&frame, self.timeout)?;
        Ok(())
    }

    /// Read one reply and validate it against `request_command`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub fn poll(
        &mut self,
        request_command: u8,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let Some(response) = self.transport.read(1, timeout)? else {
            return Ok(None);
        };
        Ok(self
            .codec
            .validate(request_command, &response)
            .map(<[u8]>::to_vec))
    }

    /// Drain queued replies to `request_command` and return the newest.
    ///
    /// Waits up to `timeout` for the first frame, then only for frames
    /// already in flight, taking at most `limit` frames. Stale replies are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub fn poll_latest(
        &mut self,
        request_command: u8,
        timeout: Duration,
        limit: usize,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut latest = None;
        let mut dropped = 0;
        let mut wait = timeout;
        for _ in 0..limit.max(1) {
            let Some(response) = self.transport.read(1, wait)? else {
                break;
            };
            wait = DRAIN_TIMEOUT;
            if let Some(payload) = self.codec.validate(request_command, &response) {
                if latest.replace(payload.to_vec()).is_some() {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            debug!("Dropped {dropped} stale replies");
        }
        Ok(latest)
    }

    /// Discard anything the transport has buffered.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub fn clear_buffers(&mut self) -> Result<(), ProtocolError> {
        self.transport.clear_buffers()?;
        Ok(())
    }

    /// Ask the device who it is.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub fn identify(&mut self) -> Result<Option<Identity>, ProtocolError> {
        let endpoint = self.endpoint();
        Ok(self
            .execute(&Request::Identify)?
            .map(|raw| Identity::parse(endpoint, &raw)))
    }

    /// Read `length` consecutive bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the transport fails.
    pub fn read_block(&mut self, address: u32, length: usize) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.execute(&Request::ReadBlock {
            address,
            length,
            continuous: false,
        })
    }

    /// Read one byte from each address, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the transport fails.
    pub fn read_addresses(&mut self, addresses: &[u32]) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.execute(&Request::ReadAddresses {
            addresses: addresses.to_vec(),
            continuous: false,
        })
    }

    /// Write consecutive bytes; returns the device's echo of the written data.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the transport fails.
    pub fn write_block(&mut self, address: u32, data: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.execute(&Request::WriteBlock {
            address,
            data: data.to_vec(),
        })
    }

    /// Write a single byte; returns the device's echo.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the transport fails.
    pub fn write_address(&mut self, address: u32, value: u8) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.execute(&Request::WriteAddress { address, value })
    }

    /// Stop a continuous stream.
    ///
    /// Any new single-shot request ends streaming on the device, so this sends
    /// a one-byte block read and drains frames until its reply shows up.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub fn interrupt(&mut self) -> Result<(), ProtocolError> {
        let stop = Request::ReadBlock {
            address: 0,
            length: 1,
            continuous: false,
        };
        let command = stop.command().as_u8();
        self.send(&stop)?;

        for _ in 0..INTERRUPT_DRAIN_LIMIT {
            let Some(response) = self.transport.read(1, INTERRUPT_TIMEOUT)? else {
                break;
            };
            if self.codec.validate(command, &response).is_some() {
                debug!("Stream interrupted");
                self.transport.clear_buffers()?;
                return Ok(());
            }
        }
        warn!("No reply to interrupt request; stream state unknown");
        self.transport.clear_buffers()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{LoopbackTransport, SimulatedEcu};

    fn protocol() -> Protocol<LoopbackTransport> {
        let mut ecu = SimulatedEcu::new(Endpoint::Ecu, SimulatedEcu::default_identity());
        ecu.load(0x1000, &[0xDE, 0xAD, 0xBE, 0xEF]);
        Protocol::new(LoopbackTransport::new(ecu), Endpoint::Ecu, DEFAULT_TIMEOUT)
    }

    #[test]
    fn test_identify() {
        let mut protocol = protocol();
        let identity = protocol.identify().unwrap().unwrap();
        assert_eq!(identity.endpoint, Endpoint::Ecu);
        assert_eq!(identity.identifier, "4A12345678");
        assert_eq!(identity.capabilities(), &SimulatedEcu::default_identity()[8..]);
    }

    #[test]
    fn test_identify_wrong_endpoint_times_out() {
        let mut protocol = protocol();
        protocol.set_endpoint(Endpoint::Tcu);
        assert_eq!(protocol.identify().unwrap(), None);
    }

    #[test]
    fn test_read_and_write() {
        let mut protocol = protocol();
        assert_eq!(
            protocol.read_block(0x1000, 4).unwrap(),
            Some(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert_eq!(
            protocol.write_block(0x1001, &[1, 2]).unwrap(),
            Some(vec![1, 2])
        );
        assert_eq!(protocol.write_address(0x1003, 9).unwrap(), Some(vec![9]));
        assert_eq!(
            protocol.read_addresses(&[0x1003, 0x1000, 0x1001]).unwrap(),
            Some(vec![9, 0xDE, 1])
        );
    }

    #[test]
    fn test_continuous_stream_and_interrupt() {
        let mut protocol = protocol();
        let request = Request::ReadAddresses {
            addresses: vec![0x1000],
            continuous: true,
        };
        assert_eq!(protocol.execute(&request).unwrap(), None);
        for _ in 0..3 {
            let data = protocol.poll(0xA8, Duration::from_millis(10)).unwrap();
            assert_eq!(data, Some(vec![0xDE]));
        }
        protocol.interrupt().unwrap();
        assert!(!protocol.transport().ecu().is_streaming());
        assert_eq!(protocol.poll(0xA8, Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_poll_latest_keeps_newest_reply() {
        let mut protocol = protocol();
        let read = Request::ReadBlock {
            address: 0x1000,
            length: 1,
            continuous: false,
        };
        protocol.send(&read).unwrap();
        protocol.send(&Request::Identify).unwrap();
        protocol.transport_mut().ecu_mut().load(0x1000, &[0x11]);
        protocol.send(&read).unwrap();

        let latest = protocol.poll_latest(0xA0, Duration::from_millis(10), 16).unwrap();
        assert_eq!(latest, Some(vec![0x11]));
        assert_eq!(protocol.poll(0xA0, Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_poll_latest_is_bounded_on_a_stream() {
        let mut protocol = protocol();
        let request = Request::ReadAddresses {
            addresses: vec![0x1000],
            continuous: true,
        };
        protocol.execute(&request).unwrap();
        let latest = protocol.poll_latest(0xA8, Duration::from_millis(10), 4).unwrap();
        assert_eq!(latest, Some(vec![0xDE]));
        assert!(protocol.transport().ecu().is_streaming());
    }

    #[test]
    fn test_oversized_request_never_reaches_transport() {
        let mut protocol = protocol();
        let request = Request::ReadAddresses {
            addresses: (0..100).collect(),
            continuous: false,
        };
        assert!(matches!(
            protocol.execute(&request),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
        assert_eq!(protocol.transport().frames_received(), 0);
    }
}
