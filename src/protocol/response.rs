//! Response frame encoding and decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::error::{Result, ScrutinyError};
use crate::protocol::commands::Command;
use crate::protocol::crc::crc32;

/// Outcome code carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    InvalidRequest = 1,
    UnsupportedFeature = 2,
    Overflow = 3,
    Busy = 4,
    FailureToProceed = 5,
    NoDataToReturn = 6,
}

impl ResponseCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::InvalidRequest),
            2 => Some(Self::UnsupportedFeature),
            3 => Some(Self::Overflow),
            4 => Some(Self::Busy),
            5 => Some(Self::FailureToProceed),
            6 => Some(Self::NoDataToReturn),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::InvalidRequest => "InvalidRequest",
            Self::UnsupportedFeature => "UnsupportedFeature",
            Self::Overflow => "Overflow",
            Self::Busy => "Busy",
            Self::FailureToProceed => "FailureToProceed",
            Self::NoDataToReturn => "NoDataToReturn",
        };
        write!(f, "{}", s)
    }
}

/// A response received from the device.
///
/// On the wire the command byte has bit 7 set to distinguish response frames
/// from request frames; the decoded form carries the bare command.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Command this response answers.
    pub command: Command,

    /// Subfunction this response answers.
    pub subfn: u8,

    /// Outcome code.
    pub code: ResponseCode,

    /// Response payload bytes.
    pub payload: Bytes,
}

/// Bit set on the command byte of response frames.
const RESPONSE_FLAG: u8 = 0x80;

impl Response {
    /// Frame bytes besides the payload: 5-byte header + 4-byte CRC.
    pub const OVERHEAD: usize = 9;

    /// Create a response.
    pub fn new(command: Command, subfn: u8, code: ResponseCode, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            subfn,
            code,
            payload: payload.into(),
        }
    }

    /// Create a payload-less response with the given code.
    pub fn empty(command: Command, subfn: u8, code: ResponseCode) -> Self {
        Self::new(command, subfn, code, Bytes::new())
    }

    /// Total size of the encoded frame.
    pub fn size_on_wire(&self) -> usize {
        Self::OVERHEAD + self.payload.len()
    }

    /// Encode the frame, CRC included.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_wire());
        buf.put_u8(self.command.id() | RESPONSE_FLAG);
        buf.put_u8(self.subfn);
        buf.put_u8(self.code as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        let crc = crc32(&buf);
        buf.put_u32(crc);
        buf.freeze()
    }

    /// Decode a frame, validating the response flag, length and CRC.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::OVERHEAD {
            return Err(ScrutinyError::decode(format!("response frame too short: {} bytes", data.len())));
        }

        let mut cursor = &data[..];
        let command_byte = cursor.get_u8();
        let subfn = cursor.get_u8();
        let code_byte = cursor.get_u8();
        let length = cursor.get_u16() as usize;

        if command_byte & RESPONSE_FLAG == 0 {
            return Err(ScrutinyError::decode("response flag not set on command byte"));
        }
        if data.len() != Self::OVERHEAD + length {
            return Err(ScrutinyError::decode(format!(
                "response length field says {} payload bytes, frame has {}",
                length,
                data.len() - Self::OVERHEAD
            )));
        }

        let crc_offset = data.len() - 4;
        let expected_crc = u32::from_be_bytes([data[crc_offset], data[crc_offset + 1], data[crc_offset + 2], data[crc_offset + 3]]);
        let actual_crc = crc32(&data[..crc_offset]);
        if expected_crc != actual_crc {
            return Err(ScrutinyError::decode(format!(
                "response CRC mismatch: computed 0x{:08X}, frame carries 0x{:08X}",
                actual_crc, expected_crc
            )));
        }

        let command = Command::from_id(command_byte & !RESPONSE_FLAG).ok_or_else(|| {
            ScrutinyError::decode(format!("unknown command id 0x{:02X}", command_byte & !RESPONSE_FLAG))
        })?;
        let code = ResponseCode::from_u8(code_byte)
            .ok_or_else(|| ScrutinyError::decode(format!("unknown response code 0x{:02X}", code_byte)))?;

        Ok(Self {
            command,
            subfn,
            code,
            payload: Bytes::copy_from_slice(&data[5..5 + length]),
        })
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Response(cmd={}, subfn={}, code={}, payload_len={})",
            self.command,
            self.subfn,
            self.code,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let resp = Response::new(Command::CommControl, 5, ResponseCode::Ok, vec![1, 2, 3, 4]);
        let encoded = resp.to_bytes();
        assert_eq!(encoded[0], Command::CommControl.id() | 0x80);
        assert_eq!(encoded[2], 0);

        let decoded = Response::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_missing_response_flag_rejected() {
        let resp = Response::empty(Command::GetInfo, 1, ResponseCode::Ok);
        let mut encoded = resp.to_bytes().to_vec();
        encoded[0] &= 0x7F;
        // CRC no longer matches either, but the flag check fires first on a
        // frame re-CRCed by an hostile peer.
        let fixed_crc = crc32(&encoded[..encoded.len() - 4]);
        let len = encoded.len();
        encoded[len - 4..].copy_from_slice(&fixed_crc.to_be_bytes());
        assert!(Response::from_bytes(&encoded).is_err());
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut encoded = Response::empty(Command::GetInfo, 1, ResponseCode::Busy).to_bytes().to_vec();
        let len = encoded.len();
        encoded[len - 1] ^= 0x01;
        assert!(Response::from_bytes(&encoded).is_err());
    }

    #[test]
    fn test_all_codes_roundtrip() {
        for code in [
            ResponseCode::Ok,
            ResponseCode::InvalidRequest,
            ResponseCode::UnsupportedFeature,
            ResponseCode::Overflow,
            ResponseCode::Busy,
            ResponseCode::FailureToProceed,
            ResponseCode::NoDataToReturn,
        ] {
            assert_eq!(ResponseCode::from_u8(code as u8), Some(code));
        }
    }
}
