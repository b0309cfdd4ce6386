//! AES-256-GCM for the secure data channel.
//!
//! Nonces are drawn from the system RNG on every call to [`encrypt`]; callers
//! never choose them. Decryption verifies the tag before any plaintext is
//! handed back.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// AES-256 key size.
pub const KEY_LEN: usize = 32;

/// GCM nonce size.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag size.
pub const TAG_LEN: usize = 16;

/// Bytes added to every plaintext on the wire.
pub const ENCRYPTION_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Output of [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

impl Sealed {
    /// Wire layout: `nonce(12) || tag(16) || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCRYPTION_OVERHEAD + self.ciphertext.len());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.tag);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    /// Parse the wire layout. Input too short to hold a nonce and tag cannot
    /// authenticate, so it is reported the same way as a bad tag.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < ENCRYPTION_OVERHEAD {
            return Err(CryptoError::AuthenticationFailure);
        }
        let mut nonce = [0u8; NONCE_LEN];
        let mut tag = [0u8; TAG_LEN];
        nonce.copy_from_slice(&data[..NONCE_LEN]);
        tag.copy_from_slice(&data[NONCE_LEN..ENCRYPTION_OVERHEAD]);
        Ok(Self {
            ciphertext: data[ENCRYPTION_OVERHEAD..].to_vec(),
            nonce,
            tag,
        })
    }

    pub fn open(&self, key: &[u8; KEY_LEN], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        decrypt(&self.ciphertext, &self.nonce, &self.tag, key, aad)
    }
}

fn aead_key(key: &[u8; KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::KeyDerivation)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key`, binding `aad`, with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN], aad: &[u8]) -> Result<Sealed, CryptoError> {
    let rng = SystemRandom::new();
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce).map_err(|_| CryptoError::Rng)?;

    let key = aead_key(key)?;
    let mut in_out = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::AuthenticationFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());
    Ok(Sealed {
        ciphertext: in_out,
        nonce,
        tag: tag_bytes,
    })
}

/// Decrypt and authenticate. Any mismatch of key, nonce, tag, ciphertext or
/// AAD yields [`CryptoError::AuthenticationFailure`] and no plaintext.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    tag: &[u8; TAG_LEN],
    key: &[u8; KEY_LEN],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = aead_key(key)?;
    let mut in_out = Zeroizing::new(Vec::with_capacity(ciphertext.len() + TAG_LEN));
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext_len = key
        .open_in_place(
            Nonce::assume_unique_for_key(*nonce),
            Aad::from(aad),
            in_out.as_mut_slice(),
        )
        .map_err(|_| CryptoError::AuthenticationFailure)?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}
