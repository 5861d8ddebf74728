//! Scalar encode/decode between [`Value`]s and device memory bytes.
//!
//! Integers and floats honor the device's declared endianness. Booleans are a
//! single byte restricted to {0,1}. Bitfield helpers operate on the unsigned
//! interpretation of the containing field.

use crate::core::error::{Result, ScrutinyError};
use crate::core::types::{EmbeddedDataType, Endianness, Value};

fn conversion_error(value: &Value, datatype: EmbeddedDataType) -> ScrutinyError {
    ScrutinyError::ValueConversion(format!("{} does not fit in {}", value, datatype))
}

/// Encode a value into its device representation.
///
/// The returned buffer is exactly `datatype.size_bytes()` long. Integer values
/// are range-checked; floats are narrowed with IEEE rounding.
pub fn encode(value: &Value, datatype: EmbeddedDataType, endianness: Endianness) -> Result<Vec<u8>> {
    let bytes = match datatype {
        EmbeddedDataType::Uint8 | EmbeddedDataType::Uint16 | EmbeddedDataType::Uint32 | EmbeddedDataType::Uint64 => {
            let raw = value.as_u64().ok_or_else(|| conversion_error(value, datatype))?;
            let max = match datatype.size_bytes() {
                8 => u64::MAX,
                n => (1u64 << (n * 8)) - 1,
            };
            if raw > max {
                return Err(conversion_error(value, datatype));
            }
            trim(raw.to_be_bytes(), datatype, endianness)
        }
        EmbeddedDataType::Sint8 | EmbeddedDataType::Sint16 | EmbeddedDataType::Sint32 | EmbeddedDataType::Sint64 => {
            let raw = value.as_i64().ok_or_else(|| conversion_error(value, datatype))?;
            let bits = datatype.size_bits() as u32;
            if bits < 64 {
                let min = -(1i64 << (bits - 1));
                let max = (1i64 << (bits - 1)) - 1;
                if raw < min || raw > max {
                    return Err(conversion_error(value, datatype));
                }
            }
            trim((raw as u64).to_be_bytes(), datatype, endianness)
        }
        EmbeddedDataType::Float32 => {
            let v = value.as_f64() as f32;
            match endianness {
                Endianness::Little => v.to_le_bytes().to_vec(),
                Endianness::Big => v.to_be_bytes().to_vec(),
            }
        }
        EmbeddedDataType::Float64 => {
            let v = value.as_f64();
            match endianness {
                Endianness::Little => v.to_le_bytes().to_vec(),
                Endianness::Big => v.to_be_bytes().to_vec(),
            }
        }
        EmbeddedDataType::Boolean => vec![value.as_bool() as u8],
    };
    Ok(bytes)
}

// Keep the low `size` bytes of a big-endian u64 image, then order them.
fn trim(be: [u8; 8], datatype: EmbeddedDataType, endianness: Endianness) -> Vec<u8> {
    let size = datatype.size_bytes();
    let mut out = be[8 - size..].to_vec();
    if endianness == Endianness::Little {
        out.reverse();
    }
    out
}

/// Decode device bytes into a value.
///
/// `data` must be exactly `datatype.size_bytes()` long.
pub fn decode(data: &[u8], datatype: EmbeddedDataType, endianness: Endianness) -> Result<Value> {
    if data.len() != datatype.size_bytes() {
        return Err(ScrutinyError::decode(format!(
            "expected {} bytes for {}, got {}",
            datatype.size_bytes(),
            datatype,
            data.len()
        )));
    }

    let raw = read_unsigned(data, endianness);
    let value = match datatype {
        EmbeddedDataType::Uint8 | EmbeddedDataType::Uint16 | EmbeddedDataType::Uint32 | EmbeddedDataType::Uint64 => {
            Value::Uint(raw)
        }
        EmbeddedDataType::Sint8 | EmbeddedDataType::Sint16 | EmbeddedDataType::Sint32 | EmbeddedDataType::Sint64 => {
            Value::Sint(sign_extend(raw, datatype.size_bits() as u32))
        }
        EmbeddedDataType::Float32 => Value::Float(f32::from_bits(raw as u32) as f64),
        EmbeddedDataType::Float64 => Value::Float(f64::from_bits(raw)),
        EmbeddedDataType::Boolean => Value::Bool(raw != 0),
    };
    Ok(value)
}

fn read_unsigned(data: &[u8], endianness: Endianness) -> u64 {
    let mut raw: u64 = 0;
    match endianness {
        Endianness::Big => {
            for b in data {
                raw = (raw << 8) | *b as u64;
            }
        }
        Endianness::Little => {
            for b in data.iter().rev() {
                raw = (raw << 8) | *b as u64;
            }
        }
    }
    raw
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

/// Extract a bitfield from the encoded containing field.
///
/// Bit 0 is the least significant bit of the field's integer interpretation.
/// Only integer and boolean containers support bitfields.
pub fn decode_bitfield(
    data: &[u8],
    datatype: EmbeddedDataType,
    endianness: Endianness,
    bitoffset: u8,
    bitsize: u8,
) -> Result<Value> {
    check_bitfield(datatype, bitoffset, bitsize)?;
    if data.len() != datatype.size_bytes() {
        return Err(ScrutinyError::decode(format!(
            "expected {} bytes for {}, got {}",
            datatype.size_bytes(),
            datatype,
            data.len()
        )));
    }
    let raw = read_unsigned(data, endianness);
    let extracted = (raw >> bitoffset) & bit_ones(bitsize);
    let value = if datatype == EmbeddedDataType::Boolean {
        Value::Bool(extracted != 0)
    } else if datatype.is_signed() {
        Value::Sint(sign_extend(extracted, bitsize as u32))
    } else {
        Value::Uint(extracted)
    };
    Ok(value)
}

/// Encode a value into the data/mask pair of a masked write.
///
/// Returns `(data, mask)`, both `datatype.size_bytes()` long, suitable for a
/// WriteMasked operation: the device applies `(data & mask) | (mem & !mask)`.
pub fn encode_bitfield(
    value: &Value,
    datatype: EmbeddedDataType,
    endianness: Endianness,
    bitoffset: u8,
    bitsize: u8,
) -> Result<(Vec<u8>, Vec<u8>)> {
    check_bitfield(datatype, bitoffset, bitsize)?;
    let raw = if datatype.is_signed() {
        let v = value.as_i64().ok_or_else(|| conversion_error(value, datatype))?;
        let min = -(1i64 << (bitsize - 1).max(0));
        let max = (1i64 << (bitsize - 1)) - 1;
        if bitsize > 1 && (v < min || v > max) {
            return Err(conversion_error(value, datatype));
        }
        (v as u64) & bit_ones(bitsize)
    } else {
        let v = value.as_u64().ok_or_else(|| conversion_error(value, datatype))?;
        if v > bit_ones(bitsize) {
            return Err(conversion_error(value, datatype));
        }
        v
    };

    let mask = bit_ones(bitsize) << bitoffset;
    let data = raw << bitoffset;
    let size = datatype.size_bytes();
    Ok((
        order_bytes(data, size, endianness),
        order_bytes(mask, size, endianness),
    ))
}

fn check_bitfield(datatype: EmbeddedDataType, bitoffset: u8, bitsize: u8) -> Result<()> {
    if datatype.is_float() {
        return Err(ScrutinyError::config("bitfields are not allowed on floating-point variables"));
    }
    if bitsize == 0 || (bitoffset as usize + bitsize as usize) > datatype.size_bits() {
        return Err(ScrutinyError::config(format!(
            "bitfield [{}+{}] does not fit in {}",
            bitoffset, bitsize, datatype
        )));
    }
    Ok(())
}

fn bit_ones(bitsize: u8) -> u64 {
    if bitsize >= 64 {
        u64::MAX
    } else {
        (1u64 << bitsize) - 1
    }
}

fn order_bytes(raw: u64, size: usize, endianness: Endianness) -> Vec<u8> {
    let be = raw.to_be_bytes();
    let mut out = be[8 - size..].to_vec();
    if endianness == Endianness::Little {
        out.reverse();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float32_little_endian() {
        let encoded = encode(&Value::Float(2.7), EmbeddedDataType::Float32, Endianness::Little).unwrap();
        assert_eq!(encoded, vec![0xCD, 0xCC, 0x2C, 0x40]);
        let decoded = decode(&encoded, EmbeddedDataType::Float32, Endianness::Little).unwrap();
        assert_eq!(decoded, Value::Float(2.7f32 as f64));
    }

    #[test]
    fn test_signed_roundtrip() {
        let encoded = encode(&Value::Sint(-65), EmbeddedDataType::Sint8, Endianness::Big).unwrap();
        assert_eq!(encoded, vec![0xBF]);
        assert_eq!(decode(&encoded, EmbeddedDataType::Sint8, Endianness::Big).unwrap(), Value::Sint(-65));

        let encoded = encode(
            &Value::Sint(0x0123_4567_89AB_CDEF),
            EmbeddedDataType::Sint64,
            Endianness::Little,
        )
        .unwrap();
        assert_eq!(encoded[0], 0xEF);
        assert_eq!(
            decode(&encoded, EmbeddedDataType::Sint64, Endianness::Little).unwrap(),
            Value::Sint(0x0123_4567_89AB_CDEF)
        );
    }

    #[test]
    fn test_unsigned_range_check() {
        assert!(encode(&Value::Uint(255), EmbeddedDataType::Uint8, Endianness::Big).is_ok());
        assert!(encode(&Value::Uint(256), EmbeddedDataType::Uint8, Endianness::Big).is_err());
        assert!(encode(&Value::Sint(128), EmbeddedDataType::Sint8, Endianness::Big).is_err());
    }

    #[test]
    fn test_boolean() {
        assert_eq!(encode(&Value::Bool(true), EmbeddedDataType::Boolean, Endianness::Little).unwrap(), vec![1]);
        assert_eq!(decode(&[0], EmbeddedDataType::Boolean, Endianness::Big).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_bitfield_extract() {
        // uint16 = 0b0000_0110_1000_0000, field at offset 7, size 4 -> 0b1101 = 13
        let data = 0b0000_0110_1000_0000u16.to_le_bytes();
        let v = decode_bitfield(&data, EmbeddedDataType::Uint16, Endianness::Little, 7, 4).unwrap();
        assert_eq!(v, Value::Uint(13));
    }

    #[test]
    fn test_bitfield_masked_write() {
        let (data, mask) = encode_bitfield(&Value::Uint(0b101), EmbeddedDataType::Uint16, Endianness::Little, 4, 3).unwrap();
        assert_eq!(mask, 0b0000_0000_0111_0000u16.to_le_bytes().to_vec());
        assert_eq!(data, 0b0000_0000_0101_0000u16.to_le_bytes().to_vec());
    }

    #[test]
    fn test_bitfield_rejects_floats() {
        assert!(decode_bitfield(&[0; 4], EmbeddedDataType::Float32, Endianness::Little, 0, 4).is_err());
    }
}
