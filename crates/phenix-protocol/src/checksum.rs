//! Additive frame checksum.
//!
//! One byte, sum of the payload mod 256. It catches line noise on the serial
//! link and nothing more: integrity against an adversary comes from the AEAD
//! layer.

/// Sum of all bytes, wrapping at 256.
pub fn additive(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Check `data` against a checksum read off the wire.
pub fn verify(data: &[u8], expected: u8) -> bool {
    additive(data) == expected
}
