use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    #[error("ciphertext targets unknown key {}", hex(.0))]
    UnknownKey([u8; 8]),

    #[error("decapsulation failed: key confirmation mismatch")]
    DecapsulationFailed,

    #[error("authentication failed: invalid key or tampered data")]
    AuthenticationFailure,

    #[error("peer reflected our own handshake nonce")]
    ReflectedHandshake,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("random number generator failed")]
    Rng,
}

/// Lowercase hex rendering used for key ids and fingerprints.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_display_is_hex() {
        let e = CryptoError::UnknownKey([0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]);
        assert!(e.to_string().contains("deadbeef00010203"));
    }

    #[test]
    fn invalid_length_display() {
        let e = CryptoError::InvalidLength {
            what: "ML-KEM public key",
            expected: 1184,
            actual: 12,
        };
        let msg = e.to_string();
        assert!(msg.contains("ML-KEM public key"));
        assert!(msg.contains("1184"));
        assert!(msg.contains("12"));
    }
}
