//! Live parameter definitions and value decoding.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use ssmtune_protocol_lib::MAX_ADDRESS;

use crate::error::QueryError;

/// Byte addresses a single parameter reads. Nothing wider than 4 bytes.
pub type ByteAddresses = SmallVec<[u32; 4]>;

/// Storage type of a parameter on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    /// Single flag bit inside one byte
    Bit { bit: u8 },
}

impl DataType {
    /// Width in bytes
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 | Self::Bit { .. } => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Linear raw to display conversion: `display = raw * factor + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
}

impl Scaling {
    #[must_use]
    pub fn to_display(self, raw: f64) -> f64 {
        raw.mul_add(self.factor, self.offset)
    }

    #[must_use]
    pub fn to_raw(self, display: f64) -> f64 {
        (display - self.offset) / self.factor
    }
}

/// Decoded parameter value
#[derive(Debug, Clone, Copy, PartialEq, Display, Serialize)]
pub enum Value {
    #[display("{}", if *_0 { "on" } else { "off" })]
    Bit(bool),
    /// Numeric value after scaling
    #[display("{_0:.2}")]
    Scaled(f64),
    /// Unscaled bytes as an unsigned integer
    #[display("{_0}")]
    Raw(u64),
}

/// A live parameter as supplied by the definition collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub id: String,
    pub name: String,
    pub data_type: DataType,
    /// Either one base address or one address per byte
    pub addresses: Vec<u32>,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Scaling>,
    #[serde(default)]
    pub enabled: bool,
    /// Bytes from the most recent extraction
    #[serde(skip)]
    pub last_raw: Option<Vec<u8>>,
}

impl ParameterDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data_type: DataType, addresses: Vec<u32>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data_type,
            addresses,
            byte_order: ByteOrder::default(),
            scaling: None,
            enabled: true,
            last_raw: None,
        }
    }

    #[must_use]
    pub const fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    #[must_use]
    pub const fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Disabling also forgets the last value.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.last_raw = None;
    }

    /// Device byte addresses in read order.
    ///
    /// A single address on a multi-byte type expands to the consecutive
    /// addresses implied by the type width.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::AddressOutOfRange`] if any byte address falls
    /// outside the 24-bit device address space.
    pub fn byte_addresses(&self) -> Result<ByteAddresses, QueryError> {
        let out_of_range = || QueryError::AddressOutOfRange { id: self.id.clone() };
        let addresses: ByteAddresses = match self.addresses.as_slice() {
            [base] => (0u32..)
                .take(self.data_type.width())
                .map(|offset| base.checked_add(offset))
                .collect::<Option<_>>()
                .ok_or_else(out_of_range)?,
            addresses => addresses.iter().copied().collect(),
        };
        if addresses.iter().any(|&address| address > MAX_ADDRESS) {
            return Err(out_of_range());
        }
        Ok(addresses)
    }

    /// Decode raw bytes (in read order) into a value.
    ///
    /// Returns `None` when the byte count does not match the type width.
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> Option<Value> {
        if bytes.len() != self.data_type.width() {
            return None;
        }
        if let DataType::Bit { bit } = self.data_type {
            return Some(Value::Bit(bytes[0] >> (bit & 7) & 1 == 1));
        }

        let raw = match self.byte_order {
            ByteOrder::Big => bytes.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b)),
            ByteOrder::Little => bytes.iter().rev().fold(0u64, |acc, &b| acc << 8 | u64::from(b)),
        };
        let Some(scaling) = self.scaling else {
            return Some(Value::Raw(raw));
        };

        #[allow(clippy::cast_possible_truncation)] // raw holds exactly `width` bytes
        #[allow(clippy::cast_precision_loss)]
        let numeric = match self.data_type {
            DataType::I8 => f64::from(raw as u8 as i8),
            DataType::I16 => f64::from(raw as u16 as i16),
            DataType::I32 => f64::from(raw as u32 as i32),
            DataType::F32 => f64::from(f32::from_bits(raw as u32)),
            _ => raw as f64,
        };
        Some(Value::Scaled(scaling.to_display(numeric)))
    }
}
