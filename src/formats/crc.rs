//! CRC-64-ISO checksum utilities for tile file footers.

use crc::{Crc, CRC_64_GO_ISO};

pub const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Compute CRC-64 checksum for a byte slice.
pub fn checksum(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_stable() {
        let a = checksum(b"tile bytes");
        let b = checksum(b"tile bytes");
        assert_eq!(a, b);
        assert_ne!(a, checksum(b"tile bytez"));
        assert_ne!(a, 0);
    }
}
