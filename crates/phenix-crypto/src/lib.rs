//! Phenix cryptographic layer.
//!
//! - Hybrid key encapsulation (ML-KEM-768 + X25519, HKDF-SHA256)
//! - Session key derivation from both handshake directions
//! - AES-256-GCM transport with random nonces
//! - Keypair rotation with a bounded, time-limited history

pub mod aead;
pub mod error;
pub mod hybrid;
pub mod kdf;
pub mod rotator;

pub use aead::{decrypt, encrypt, Sealed};
pub use error::CryptoError;
pub use hybrid::{
    decapsulate, encapsulate, HybridCiphertext, HybridKeyPair, HybridPublicKey, HybridSharedSecret,
    KeyId,
};
pub use kdf::{derive_session_keys, SessionKeys};
pub use rotator::{should_rotate, KeyHistory, KeyRotator, RotationConfig, RotationState};
