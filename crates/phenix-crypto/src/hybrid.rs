//! Hybrid key encapsulation: ML-KEM-768 combined with X25519.
//!
//! The sender encapsulates to the recipient's ML-KEM key and runs an
//! ephemeral X25519 exchange against the recipient's static X25519 key. Both
//! secrets go through HKDF into one encryption key and one authentication
//! key. The ciphertext carries the recipient key id and an HMAC over the
//! exchange under the authentication key, so decapsulating with the wrong
//! private key fails loudly instead of yielding a silently different secret.

use kem::{Decapsulate, Encapsulate};
use ml_kem::kem::{DecapsulationKey, EncapsulationKey};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768, MlKem768Params};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{hex, CryptoError};
use crate::kdf::{self, SymmetricKey, HYBRID_SALT};

/// ML-KEM-768 encapsulation key size.
pub const KEM_PUBLIC_KEY_LEN: usize = 1184;

/// ML-KEM-768 decapsulation key size.
pub const KEM_PRIVATE_KEY_LEN: usize = 2400;

/// ML-KEM-768 ciphertext size.
pub const KEM_CIPHERTEXT_LEN: usize = 1088;

/// X25519 public key size.
pub const EC_PUBLIC_KEY_LEN: usize = 32;

/// Size of each raw shared secret.
pub const SHARED_SECRET_LEN: usize = 32;

/// Truncated SHA-256 over a public key.
pub const KEY_ID_LEN: usize = 8;

/// HMAC-SHA256 key confirmation size.
pub const CONFIRMATION_LEN: usize = 32;

pub type KeyId = [u8; KEY_ID_LEN];

fn check_len(what: &'static str, data: &[u8], expected: usize) -> Result<(), CryptoError> {
    if data.len() != expected {
        return Err(CryptoError::InvalidLength {
            what,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Public half of a [`HybridKeyPair`], as sent in a handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct HybridPublicKey {
    kem: Vec<u8>,
    ec: [u8; EC_PUBLIC_KEY_LEN],
}

impl HybridPublicKey {
    /// Validates both lengths before anything touches the key material.
    pub fn from_bytes(kem: &[u8], ec: &[u8]) -> Result<Self, CryptoError> {
        check_len("ML-KEM public key", kem, KEM_PUBLIC_KEY_LEN)?;
        check_len("X25519 public key", ec, EC_PUBLIC_KEY_LEN)?;
        let mut ec_bytes = [0u8; EC_PUBLIC_KEY_LEN];
        ec_bytes.copy_from_slice(ec);
        Ok(Self {
            kem: kem.to_vec(),
            ec: ec_bytes,
        })
    }

    pub fn kem_bytes(&self) -> &[u8] {
        &self.kem
    }

    pub fn ec_bytes(&self) -> &[u8; EC_PUBLIC_KEY_LEN] {
        &self.ec
    }

    pub fn key_id(&self) -> KeyId {
        let digest = Sha256::new()
            .chain_update(&self.kem)
            .chain_update(self.ec)
            .finalize();
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        id
    }

    pub fn fingerprint(&self) -> String {
        hex(&self.key_id())
    }
}

impl std::fmt::Debug for HybridPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HybridPublicKey").field(&self.fingerprint()).finish()
    }
}

/// A local hybrid keypair. Private halves never leave this type.
pub struct HybridKeyPair {
    kem_private: Zeroizing<[u8; KEM_PRIVATE_KEY_LEN]>,
    ec_private: Zeroizing<StaticSecret>,
    public: HybridPublicKey,
    key_id: KeyId,
}

impl HybridKeyPair {
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let (dk, ek) = MlKem768::generate(&mut rng);

        let mut kem_private = Zeroizing::new([0u8; KEM_PRIVATE_KEY_LEN]);
        kem_private.copy_from_slice(&dk.as_bytes()[..]);

        let ec_private = StaticSecret::random_from_rng(OsRng);
        let ec_public = PublicKey::from(&ec_private);

        let public = HybridPublicKey {
            kem: ek.as_bytes().to_vec(),
            ec: *ec_public.as_bytes(),
        };
        let key_id = public.key_id();
        debug!(key_id = %hex(&key_id), "generated hybrid keypair");

        Self {
            kem_private,
            ec_private: Zeroizing::new(ec_private),
            public,
            key_id,
        }
    }

    pub fn public_key(&self) -> HybridPublicKey {
        self.public.clone()
    }

    pub fn public_key_ref(&self) -> &HybridPublicKey {
        &self.public
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn fingerprint(&self) -> String {
        hex(&self.key_id)
    }

    /// Recover the secret a peer encapsulated to this keypair.
    pub fn decapsulate(&self, ciphertext: &HybridCiphertext) -> Result<HybridSharedSecret, CryptoError> {
        decapsulate(ciphertext, self)
    }

    fn kem_decapsulate(&self, kem_ciphertext: &[u8]) -> Result<Zeroizing<[u8; SHARED_SECRET_LEN]>, CryptoError> {
        let ct: &[u8; KEM_CIPHERTEXT_LEN] = kem_ciphertext.try_into().map_err(|_| {
            CryptoError::InvalidLength {
                what: "ML-KEM ciphertext",
                expected: KEM_CIPHERTEXT_LEN,
                actual: kem_ciphertext.len(),
            }
        })?;
        let dk = DecapsulationKey::<MlKem768Params>::from_bytes(&(*self.kem_private).into());
        let ss = dk
            .decapsulate(&(*ct).into())
            .map_err(|e| CryptoError::KeyExchange(format!("ML-KEM decapsulation: {e:?}")))?;

        let mut out = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
        out.copy_from_slice(&ss[..]);
        Ok(out)
    }
}

impl std::fmt::Debug for HybridKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridKeyPair")
            .field("key_id", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// What the sender transmits in a KeyExchange frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridCiphertext {
    key_id: KeyId,
    kem_ciphertext: Vec<u8>,
    ephemeral_public_key: [u8; EC_PUBLIC_KEY_LEN],
    confirmation: [u8; CONFIRMATION_LEN],
}

impl HybridCiphertext {
    /// Rebuild from wire fields, validating every length.
    pub fn from_parts(
        key_id: KeyId,
        kem_ciphertext: &[u8],
        ephemeral_public_key: &[u8],
        confirmation: &[u8],
    ) -> Result<Self, CryptoError> {
        check_len("ML-KEM ciphertext", kem_ciphertext, KEM_CIPHERTEXT_LEN)?;
        check_len("ephemeral X25519 key", ephemeral_public_key, EC_PUBLIC_KEY_LEN)?;
        check_len("key confirmation", confirmation, CONFIRMATION_LEN)?;

        let mut eph = [0u8; EC_PUBLIC_KEY_LEN];
        eph.copy_from_slice(ephemeral_public_key);
        let mut conf = [0u8; CONFIRMATION_LEN];
        conf.copy_from_slice(confirmation);
        Ok(Self {
            key_id,
            kem_ciphertext: kem_ciphertext.to_vec(),
            ephemeral_public_key: eph,
            confirmation: conf,
        })
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn kem_ciphertext(&self) -> &[u8] {
        &self.kem_ciphertext
    }

    pub fn ephemeral_public_key(&self) -> &[u8; EC_PUBLIC_KEY_LEN] {
        &self.ephemeral_public_key
    }

    pub fn confirmation(&self) -> &[u8; CONFIRMATION_LEN] {
        &self.confirmation
    }

    fn transcript(&self) -> [&[u8]; 3] {
        [
            &self.key_id[..],
            &self.kem_ciphertext,
            &self.ephemeral_public_key[..],
        ]
    }
}

/// Secrets from one encapsulation. Zeroized on drop.
pub struct HybridSharedSecret {
    kem_secret: Zeroizing<[u8; SHARED_SECRET_LEN]>,
    ec_secret: Zeroizing<[u8; SHARED_SECRET_LEN]>,
    combined: SymmetricKey,
    auth_key: SymmetricKey,
}

impl HybridSharedSecret {
    fn derive(
        kem_secret: Zeroizing<[u8; SHARED_SECRET_LEN]>,
        ec_secret: Zeroizing<[u8; SHARED_SECRET_LEN]>,
        transcript: &[&[u8]],
    ) -> Result<Self, CryptoError> {
        let mut ikm = Zeroizing::new([0u8; 2 * SHARED_SECRET_LEN]);
        ikm[..SHARED_SECRET_LEN].copy_from_slice(kem_secret.as_slice());
        ikm[SHARED_SECRET_LEN..].copy_from_slice(ec_secret.as_slice());
        let info = transcript.concat();

        let (combined, auth_key) = kdf::expand_pair(HYBRID_SALT, ikm.as_slice(), &info)?;
        Ok(Self {
            kem_secret,
            ec_secret,
            combined,
            auth_key,
        })
    }

    pub fn kem_secret(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.kem_secret
    }

    pub fn ec_secret(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.ec_secret
    }

    /// KDF output over both secrets; the encryption half.
    pub fn combined(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.combined
    }

    pub fn auth_key(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.auth_key
    }
}

impl std::fmt::Debug for HybridSharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HybridSharedSecret(..)")
    }
}

fn reject_non_contributory(shared: [u8; SHARED_SECRET_LEN]) -> Result<Zeroizing<[u8; SHARED_SECRET_LEN]>, CryptoError> {
    let shared = Zeroizing::new(shared);
    if *shared == [0u8; SHARED_SECRET_LEN] {
        return Err(CryptoError::KeyExchange(
            "invalid X25519 public key (low-order point)".into(),
        ));
    }
    Ok(shared)
}

/// Encapsulate a fresh shared secret to `recipient`.
pub fn encapsulate(
    recipient: &HybridPublicKey,
) -> Result<(HybridCiphertext, HybridSharedSecret), CryptoError> {
    let ek_bytes: &[u8; KEM_PUBLIC_KEY_LEN] = recipient.kem.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidLength {
            what: "ML-KEM public key",
            expected: KEM_PUBLIC_KEY_LEN,
            actual: recipient.kem.len(),
        }
    })?;
    let ek = EncapsulationKey::<MlKem768Params>::from_bytes(&(*ek_bytes).into());
    let mut rng = OsRng;
    let (kem_ct, kem_ss) = ek
        .encapsulate(&mut rng)
        .map_err(|e| CryptoError::KeyExchange(format!("ML-KEM encapsulation: {e:?}")))?;

    let mut kem_secret = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
    kem_secret.copy_from_slice(&kem_ss[..]);

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let dh = ephemeral.diffie_hellman(&PublicKey::from(recipient.ec));
    let ec_secret = reject_non_contributory(*dh.as_bytes())?;

    let mut ciphertext = HybridCiphertext {
        key_id: recipient.key_id(),
        kem_ciphertext: kem_ct[..].to_vec(),
        ephemeral_public_key: *ephemeral_public.as_bytes(),
        confirmation: [0u8; CONFIRMATION_LEN],
    };

    let secret = HybridSharedSecret::derive(kem_secret, ec_secret, &ciphertext.transcript())?;
    let confirmation = kdf::hmac_sha256(secret.auth_key(), &ciphertext.transcript())?;
    ciphertext.confirmation = confirmation;

    Ok((ciphertext, secret))
}

/// Recover the shared secret with the keypair the ciphertext names.
pub fn decapsulate(
    ciphertext: &HybridCiphertext,
    keypair: &HybridKeyPair,
) -> Result<HybridSharedSecret, CryptoError> {
    if ciphertext.key_id != keypair.key_id {
        return Err(CryptoError::UnknownKey(ciphertext.key_id));
    }

    let kem_secret = keypair.kem_decapsulate(&ciphertext.kem_ciphertext)?;
    let peer = PublicKey::from(ciphertext.ephemeral_public_key);
    let dh = keypair.ec_private.diffie_hellman(&peer);
    let ec_secret = reject_non_contributory(*dh.as_bytes())?;

    let transcript = ciphertext.transcript();
    let secret = HybridSharedSecret::derive(kem_secret, ec_secret, &transcript)?;
    kdf::verify_hmac(secret.auth_key(), &transcript, &ciphertext.confirmation)?;
    Ok(secret)
}
