//! Embedded value model.
//!
//! Devices expose scalars typed with [`EmbeddedDataType`]; the server carries
//! them as protocol-agnostic [`Value`]s. The wire byte of a datatype packs the
//! family in the high nibble and log2 of the byte size in the low nibble.

use serde::{Deserialize, Serialize};

/// Scalar type of a value living on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EmbeddedDataType {
    /// Unsigned 8-bit integer
    Uint8 = 0x00,
    /// Unsigned 16-bit integer
    Uint16 = 0x01,
    /// Unsigned 32-bit integer
    Uint32 = 0x02,
    /// Unsigned 64-bit integer
    Uint64 = 0x03,
    /// Signed 8-bit integer
    Sint8 = 0x10,
    /// Signed 16-bit integer
    Sint16 = 0x11,
    /// Signed 32-bit integer
    Sint32 = 0x12,
    /// Signed 64-bit integer
    Sint64 = 0x13,
    /// IEEE-754 single precision
    Float32 = 0x22,
    /// IEEE-754 double precision
    Float64 = 0x23,
    /// One-byte boolean {0,1}
    Boolean = 0x30,
}

impl EmbeddedDataType {
    /// Size of the encoded value, in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Uint8 | Self::Sint8 | Self::Boolean => 1,
            Self::Uint16 | Self::Sint16 => 2,
            Self::Uint32 | Self::Sint32 | Self::Float32 => 4,
            Self::Uint64 | Self::Sint64 | Self::Float64 => 8,
        }
    }

    /// Size of the encoded value, in bits.
    pub fn size_bits(&self) -> usize {
        self.size_bytes() * 8
    }

    /// Byte used to identify this type on the wire.
    pub fn to_wire(&self) -> u8 {
        *self as u8
    }

    /// Decode the wire identification byte.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Uint8),
            0x01 => Some(Self::Uint16),
            0x02 => Some(Self::Uint32),
            0x03 => Some(Self::Uint64),
            0x10 => Some(Self::Sint8),
            0x11 => Some(Self::Sint16),
            0x12 => Some(Self::Sint32),
            0x13 => Some(Self::Sint64),
            0x22 => Some(Self::Float32),
            0x23 => Some(Self::Float64),
            0x30 => Some(Self::Boolean),
            _ => None,
        }
    }

    /// Check if this is an unsigned integer type.
    #[inline]
    pub fn is_unsigned(&self) -> bool {
        matches!(self, Self::Uint8 | Self::Uint16 | Self::Uint32 | Self::Uint64)
    }

    /// Check if this is a signed integer type.
    #[inline]
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Sint8 | Self::Sint16 | Self::Sint32 | Self::Sint64)
    }

    /// Check if this is a floating-point type.
    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl std::fmt::Display for EmbeddedDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Sint8 => "sint8",
            Self::Sint16 => "sint16",
            Self::Sint32 => "sint32",
            Self::Sint64 => "sint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Boolean => "boolean",
        };
        write!(f, "{}", s)
    }
}

/// Byte order of values stored in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    /// Little-endian (most embedded targets)
    #[default]
    Little,
    /// Big-endian
    Big,
}

/// A value published by the device firmware, addressable by 16-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimePublishedValue {
    /// Flat 16-bit id assigned by the firmware.
    pub id: u16,
    /// Type of the published value.
    pub datatype: EmbeddedDataType,
}

impl RuntimePublishedValue {
    /// Create a new RPV definition.
    pub fn new(id: u16, datatype: EmbeddedDataType) -> Self {
        Self { id, datatype }
    }
}

/// A protocol-agnostic scalar value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Floating-point number
    Float(f64),
    /// Signed integer
    Sint(i64),
    /// Unsigned integer
    Uint(u64),
    /// Boolean
    Bool(bool),
}

impl Value {
    /// Get the value as f64, converting integers and booleans.
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Float(v) => *v,
            Self::Sint(v) => *v as f64,
            Self::Uint(v) => *v as f64,
            Self::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Try to get the value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Sint(v) => Some(*v),
            Self::Uint(v) => i64::try_from(*v).ok(),
            Self::Float(v) => Some(*v as i64),
            Self::Bool(v) => Some(*v as i64),
        }
    }

    /// Try to get the value as u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            Self::Sint(v) => u64::try_from(*v).ok(),
            Self::Float(v) if *v >= 0.0 => Some(*v as u64),
            Self::Bool(v) => Some(*v as u64),
            _ => None,
        }
    }

    /// Get the value as bool. Nonzero numbers are true.
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(v) => *v,
            Self::Sint(v) => *v != 0,
            Self::Uint(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Sint(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Sint(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Uint(v as u64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Uint(v as u64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{}", v),
            Self::Sint(v) => write!(f, "{}", v),
            Self::Uint(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_wire_roundtrip() {
        let all = [
            EmbeddedDataType::Uint8,
            EmbeddedDataType::Uint16,
            EmbeddedDataType::Uint32,
            EmbeddedDataType::Uint64,
            EmbeddedDataType::Sint8,
            EmbeddedDataType::Sint16,
            EmbeddedDataType::Sint32,
            EmbeddedDataType::Sint64,
            EmbeddedDataType::Float32,
            EmbeddedDataType::Float64,
            EmbeddedDataType::Boolean,
        ];
        for dt in all {
            assert_eq!(EmbeddedDataType::from_wire(dt.to_wire()), Some(dt));
            assert_eq!(dt.size_bytes(), 1 << (dt.to_wire() & 0x0F));
        }
        assert!(EmbeddedDataType::from_wire(0xFF).is_none());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(42.5).as_f64(), 42.5);
        assert_eq!(Value::from(42.5).as_i64(), Some(42));
        assert_eq!(Value::from(true).as_u64(), Some(1));
        assert!(Value::from(-1i64).as_u64().is_none());
        assert!(Value::from(3u32).as_bool());
    }
}
