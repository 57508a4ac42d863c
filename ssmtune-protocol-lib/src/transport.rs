//! Transport contract and a TCP-backed implementation.

use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::codec::split_frame;
use crate::error::TransportError;

/// Smallest timeout handed to the socket; zero would disable the timeout
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

/// Byte-level link to the vehicle.
///
/// Timeouts are not errors: `read` and `query` return `Ok(None)` when nothing
/// arrived in time.
pub trait Transport: Send {
    /// Send raw bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the link fails.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read up to `max_messages` complete frames, concatenated.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the link fails.
    fn read(&mut self, max_messages: usize, timeout: Duration)
        -> Result<Option<Vec<u8>>, TransportError>;

    /// Send a request and wait for one reply frame.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the link fails.
    fn query(&mut self, data: &[u8], timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        self.write(data, timeout)?;
        self.read(1, timeout)
    }

    /// Discard anything buffered on the link.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the link fails.
    fn clear_buffers(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        (**self).write(data, timeout)
    }

    fn read(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).read(max_messages, timeout)
    }

    fn query(&mut self, data: &[u8], timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).query(data, timeout)
    }

    fn clear_buffers(&mut self) -> Result<(), TransportError> {
        (**self).clear_buffers()
    }
}

/// Frames over a TCP stream (serial bridges, the mock ECU server).
pub struct TcpTransport {
    stream: TcpStream,
    /// Bytes received but not yet returned as a complete frame
    pending: Vec<u8>,
}

impl TcpTransport {
    /// Connect to `addr` within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the address is invalid or the connection fails.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        info!("Connecting to {addr} (timeout: {}ms)", timeout.as_millis());
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::from_stream(stream)
    }

    /// Wrap an already connected stream.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if socket options cannot be set.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        info!("Transport connected to {}", stream.peer_addr()?);
        Ok(Self {
            stream,
            pending: Vec::with_capacity(256),
        })
    }

    fn take_frames(&mut self, max_messages: usize) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut taken = 0;
        while taken < max_messages {
            let Some((frame, consumed)) = split_frame(&self.pending) else {
                break;
            };
            out.extend_from_slice(frame);
            self.pending.drain(..consumed);
            taken += 1;
        }
        (taken > 0).then_some(out)
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        debug!("TX {}", hex::encode(data));
        self.stream.set_write_timeout(Some(timeout.max(MIN_SOCKET_TIMEOUT)))?;
        self.stream.write_all(data)?;
        Ok(())
    }

    fn read(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let start = Instant::now();
        let mut buffer = [0u8; 256];

        loop {
            if let Some(frames) = self.take_frames(max_messages.max(1)) {
                debug!("RX {}", hex::encode(&frames));
                return Ok(Some(frames));
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.stream.set_read_timeout(Some(remaining.max(MIN_SOCKET_TIMEOUT)))?;

            match self.stream.read(&mut buffer) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => self.pending.extend_from_slice(&buffer[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn clear_buffers(&mut self) -> Result<(), TransportError> {
        let mut buffer = [0u8; 256];
        let mut discarded = self.pending.len();
        self.pending.clear();

        self.stream.set_nonblocking(true)?;
        let result = loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => break Err(TransportError::Disconnected),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        self.stream.set_nonblocking(false)?;

        if discarded > 0 {
            warn!("Discarded {discarded} stale bytes from transport");
        }
        result
    }
}
