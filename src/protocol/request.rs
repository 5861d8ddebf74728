//! Request frame encoding and decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::error::{Result, ScrutinyError};
use crate::protocol::commands::Command;
use crate::protocol::crc::crc32;

/// An immutable request bound for the device.
///
/// Carries the declared size of the expected response payload so the
/// dispatcher can enforce buffer limits and account bandwidth before the
/// exchange happens.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Protocol command.
    pub command: Command,

    /// Command subfunction.
    pub subfn: u8,

    /// Request payload bytes.
    pub payload: Bytes,

    /// Declared payload size of the expected response.
    pub response_payload_size: usize,
}

impl Request {
    /// Frame bytes besides the payload: 4-byte header + 4-byte CRC.
    pub const OVERHEAD: usize = 8;

    /// Create a request with an empty expected response.
    pub fn new(command: Command, subfn: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            subfn,
            payload: payload.into(),
            response_payload_size: 0,
        }
    }

    /// Declare the expected response payload size.
    #[must_use]
    pub fn with_response_payload_size(mut self, size: usize) -> Self {
        self.response_payload_size = size;
        self
    }

    /// Total size of the encoded frame.
    pub fn size_on_wire(&self) -> usize {
        Self::OVERHEAD + self.payload.len()
    }

    /// Payload bits moved on the wire by this request.
    pub fn data_bits(&self) -> u64 {
        self.payload.len() as u64 * 8
    }

    /// Payload bits the declared response will move on the wire.
    pub fn expected_response_bits(&self) -> u64 {
        self.response_payload_size as u64 * 8
    }

    /// Encode the frame, CRC included.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_wire());
        buf.put_u8(self.command.id());
        buf.put_u8(self.subfn);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        let crc = crc32(&buf);
        buf.put_u32(crc);
        buf.freeze()
    }

    /// Decode a frame, validating length and CRC.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::OVERHEAD {
            return Err(ScrutinyError::decode(format!("request frame too short: {} bytes", data.len())));
        }

        let mut cursor = &data[..];
        let command_id = cursor.get_u8();
        let subfn = cursor.get_u8();
        let length = cursor.get_u16() as usize;
        if data.len() != Self::OVERHEAD + length {
            return Err(ScrutinyError::decode(format!(
                "request length field says {} payload bytes, frame has {}",
                length,
                data.len() - Self::OVERHEAD
            )));
        }

        let crc_offset = data.len() - 4;
        let expected_crc = u32::from_be_bytes([data[crc_offset], data[crc_offset + 1], data[crc_offset + 2], data[crc_offset + 3]]);
        let actual_crc = crc32(&data[..crc_offset]);
        if expected_crc != actual_crc {
            return Err(ScrutinyError::decode(format!(
                "request CRC mismatch: computed 0x{:08X}, frame carries 0x{:08X}",
                actual_crc, expected_crc
            )));
        }

        let command = Command::from_id(command_id)
            .ok_or_else(|| ScrutinyError::decode(format!("unknown command id 0x{:02X}", command_id)))?;

        Ok(Self {
            command,
            subfn,
            payload: Bytes::copy_from_slice(&data[4..4 + length]),
            response_payload_size: 0,
        })
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Request(cmd={}, subfn={}, payload_len={})",
            self.command,
            self.subfn,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let req = Request::new(Command::MemoryControl, 2, vec![0xAA, 0xBB, 0xCC]);
        let encoded = req.to_bytes();
        assert_eq!(encoded.len(), 3 + Request::OVERHEAD);
        assert_eq!(&encoded[..4], &[3, 2, 0, 3]);

        let decoded = Request::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_crc_is_trailing_bytes() {
        let req = Request::new(Command::GetInfo, 1, Bytes::new());
        let encoded = req.to_bytes();
        let crc = crc32(&encoded[..encoded.len() - 4]);
        assert_eq!(&encoded[encoded.len() - 4..], crc.to_be_bytes());
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let mut encoded = Request::new(Command::GetInfo, 1, vec![1, 2]).to_bytes().to_vec();
        encoded[4] ^= 0xFF;
        assert!(Request::from_bytes(&encoded).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let encoded = Request::new(Command::GetInfo, 1, vec![1, 2]).to_bytes();
        assert!(Request::from_bytes(&encoded[..encoded.len() - 1]).is_err());
    }
}
