//! Coalesce enabled parameters into one read request and decode its reply.

use indexmap::IndexMap;
use log::debug;
use ssmtune_protocol_lib::{Command, ProtocolError, Request, MAX_ADDRESS_READ};

use crate::error::QueryError;
use crate::parameter::{ParameterDescriptor, Value};

/// Address limit for one coalesced query: 3 request bytes per address in a
/// 255-byte frame.
pub const MAX_QUERY_ADDRESSES: usize = 255 / 3;

/// A read request the polling worker can issue repeatedly.
///
/// Writes and identify are refused, so the worker never repeats a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query(Request);

impl Query {
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotAQuery`] for anything but a read, or the
    /// encoding error if the request cannot fit in a frame.
    pub fn new(request: Request) -> Result<Self, ProtocolError> {
        if !request.is_read() {
            return Err(ProtocolError::NotAQuery {
                kind: request.command().label(),
            });
        }
        request.payload()?;
        Ok(Self(request))
    }

    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.0
    }

    #[must_use]
    pub fn command(&self) -> Command {
        self.0.command()
    }

    #[must_use]
    pub const fn is_continuous(&self) -> bool {
        self.0.is_continuous()
    }
}

/// One decoded parameter from a query response
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub id: String,
    pub value: Value,
}

/// Address map for the currently enabled parameters.
#[derive(Debug, Default)]
pub struct QueryCoalescer {
    /// Address to last byte read there, in query order
    address_map: IndexMap<u32, u8>,
}

impl QueryCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the address map from the enabled parameters.
    ///
    /// Duplicate addresses collapse onto their first position. On error the
    /// previous map is kept.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::AddressMapTooLarge`] past [`MAX_QUERY_ADDRESSES`],
    /// or [`QueryError::AddressOutOfRange`] for a parameter outside the
    /// device address space.
    pub fn rebuild(&mut self, parameters: &[ParameterDescriptor]) -> Result<usize, QueryError> {
        let mut address_map = IndexMap::new();
        for parameter in parameters.iter().filter(|p| p.enabled) {
            for address in parameter.byte_addresses()? {
                address_map.entry(address).or_insert(0);
            }
        }
        if address_map.len() > MAX_QUERY_ADDRESSES {
            return Err(QueryError::AddressMapTooLarge {
                count: address_map.len(),
                max: MAX_QUERY_ADDRESSES,
            });
        }
        debug!("Coalesced {} byte addresses", address_map.len());
        self.address_map = address_map;
        Ok(self.address_map.len())
    }

    #[must_use]
    pub fn addresses(&self) -> Vec<u32> {
        self.address_map.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.address_map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.address_map.is_empty()
    }

    /// Build the read request for the current map, `None` if it is empty.
    ///
    /// A single contiguous run is read as a block, which yields the same
    /// response layout with a shorter request. Scattered addresses are
    /// listed one by one, so at most [`MAX_ADDRESS_READ`] fit.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::AddressMapTooLarge`] for a scattered map longer
    /// than [`MAX_ADDRESS_READ`], or an error if the request cannot be
    /// encoded in one frame.
    pub fn query(&self, continuous: bool) -> Result<Option<Query>, QueryError> {
        let Some(&first) = self.address_map.keys().next() else {
            return Ok(None);
        };
        let contiguous = self
            .address_map
            .keys()
            .zip(first..)
            .all(|(&address, expected)| address == expected);

        let request = if contiguous && self.len() > 1 {
            Request::ReadBlock {
                address: first,
                length: self.len(),
                continuous,
            }
        } else if self.len() > MAX_ADDRESS_READ {
            return Err(QueryError::AddressMapTooLarge {
                count: self.len(),
                max: MAX_ADDRESS_READ,
            });
        } else {
            Request::ReadAddresses {
                addresses: self.addresses(),
                continuous,
            }
        };
        Ok(Some(Query::new(request)?))
    }

    /// Assign response bytes to the address map, then decode every enabled
    /// parameter from it.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ProtocolParseError`] if the response length does
    /// not match the address map.
    pub fn extract(
        &mut self,
        response: &[u8],
        parameters: &mut [ParameterDescriptor],
    ) -> Result<Vec<Reading>, QueryError> {
        if response.len() != self.address_map.len() {
            return Err(QueryError::ProtocolParseError {
                expected: self.address_map.len(),
                actual: response.len(),
            });
        }
        for (slot, &byte) in self.address_map.values_mut().zip(response) {
            *slot = byte;
        }

        let mut readings = Vec::new();
        for parameter in parameters.iter_mut().filter(|p| p.enabled) {
            // Rejected or enabled after the last rebuild
            let Ok(addresses) = parameter.byte_addresses() else {
                continue;
            };
            let bytes: Option<Vec<u8>> = addresses
                .iter()
                .map(|address| self.address_map.get(address).copied())
                .collect();
            let Some(bytes) = bytes else {
                continue;
            };
            if let Some(value) = parameter.decode(&bytes) {
                readings.push(Reading {
                    id: parameter.id.clone(),
                    value,
                });
            }
            parameter.last_raw = Some(bytes);
        }
        Ok(readings)
    }
}
