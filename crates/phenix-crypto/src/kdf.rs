//! HKDF-SHA256 derivations and HMAC helpers.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{hex, CryptoError};
use crate::hybrid::HybridSharedSecret;

type HmacSha256 = Hmac<Sha256>;

/// Salt for combining the ML-KEM and X25519 secrets of one encapsulation.
pub const HYBRID_SALT: &[u8] = b"phenix-hybrid-v1";

/// Info label for the session key expansion.
pub const SESSION_INFO: &[u8] = b"phenix-session-v1";

/// Label for the short authentication string.
pub const SESSION_CODE_LABEL: &[u8] = b"phenix-sas";

/// Length of every derived symmetric key.
pub const DERIVED_KEY_LEN: usize = 32;

pub type SymmetricKey = Zeroizing<[u8; DERIVED_KEY_LEN]>;

/// Expand `ikm` into an (encryption, authentication) key pair.
pub(crate) fn expand_pair(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
) -> Result<(SymmetricKey, SymmetricKey), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 2 * DERIVED_KEY_LEN]);
    hk.expand(info, okm.as_mut_slice())
        .map_err(|_| CryptoError::KeyDerivation)?;

    let mut enc = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    let mut auth = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    enc.copy_from_slice(&okm[..DERIVED_KEY_LEN]);
    auth.copy_from_slice(&okm[DERIVED_KEY_LEN..]);
    Ok((enc, auth))
}

fn mac_over(key: &[u8], parts: &[&[u8]]) -> Result<HmacSha256, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    Ok(mac_over(key, parts)?.finalize().into_bytes().into())
}

/// Constant-time tag check.
pub(crate) fn verify_hmac(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), CryptoError> {
    mac_over(key, parts)?
        .verify_slice(tag)
        .map_err(|_| CryptoError::DecapsulationFailed)
}

/// Symmetric keys for one Secure session.
pub struct SessionKeys {
    encryption_key: SymmetricKey,
    auth_key: SymmetricKey,
    session_code: String,
}

impl SessionKeys {
    pub fn encryption_key(&self) -> &[u8; DERIVED_KEY_LEN] {
        &self.encryption_key
    }

    pub fn auth_key(&self) -> &[u8; DERIVED_KEY_LEN] {
        &self.auth_key
    }

    /// Short authentication string, identical on both peers.
    pub fn session_code(&self) -> &str {
        &self.session_code
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("session_code", &self.session_code)
            .finish_non_exhaustive()
    }
}

/// Combine the secrets of both handshake directions into session keys.
///
/// `outbound` is what we encapsulated to the peer, `inbound` what the peer
/// encapsulated to us. The peer with the lower nonce contributes first, so
/// both ends feed HKDF identical input.
pub fn derive_session_keys(
    local_nonce: &[u8; 32],
    peer_nonce: &[u8; 32],
    outbound: &HybridSharedSecret,
    inbound: &HybridSharedSecret,
) -> Result<SessionKeys, CryptoError> {
    if local_nonce == peer_nonce {
        return Err(CryptoError::ReflectedHandshake);
    }

    let (first_nonce, second_nonce, first, second) = if local_nonce < peer_nonce {
        (local_nonce, peer_nonce, outbound, inbound)
    } else {
        (peer_nonce, local_nonce, inbound, outbound)
    };

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(first_nonce);
    salt[32..].copy_from_slice(second_nonce);

    let mut ikm = Zeroizing::new([0u8; 2 * DERIVED_KEY_LEN]);
    ikm[..DERIVED_KEY_LEN].copy_from_slice(first.combined());
    ikm[DERIVED_KEY_LEN..].copy_from_slice(second.combined());

    let (encryption_key, auth_key) = expand_pair(&salt, ikm.as_slice(), SESSION_INFO)?;
    let code = hmac_sha256(auth_key.as_slice(), &[SESSION_CODE_LABEL])?;

    Ok(SessionKeys {
        encryption_key,
        auth_key,
        session_code: hex(&code[..8]),
    })
}
