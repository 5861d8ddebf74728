//! CRC-32 over frame header and payload.

use crc::{Crc, CRC_32_ISO_HDLC};

// Poly 0x04C11DB7, init 0xFFFFFFFF, reflected, final XOR 0xFFFFFFFF.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC-32 appended to every frame.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // Standard CRC-32 check vector
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_empty() {
        assert_eq!(crc32(b""), 0);
    }
}
