use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{CommandCode, Frame, FrameType, StatusCode};

/// Wire protocol version carried in every handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of the random nonce each side contributes to the handshake.
pub const HANDSHAKE_NONCE_LEN: usize = 32;

/// Length of a hybrid key identifier.
pub const KEY_ID_LEN: usize = 8;

/// Payload of a Handshake frame: the sender's hybrid public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub version: u8,
    /// Fresh per handshake; orders the two peers during key derivation.
    pub nonce: [u8; HANDSHAKE_NONCE_LEN],
    /// ML-KEM encapsulation key.
    pub kem_public_key: Vec<u8>,
    /// X25519 public key.
    pub ec_public_key: Vec<u8>,
}

impl HandshakePayload {
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                peer: self.version,
                local: PROTOCOL_VERSION,
            });
        }
        Ok(())
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Frame::new(FrameType::Handshake, encode_payload(self)?)
    }
}

/// Payload of a KeyExchange frame: a hybrid ciphertext for the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangePayload {
    /// Identifier of the receiver key this was encapsulated to.
    pub key_id: [u8; KEY_ID_LEN],
    pub kem_ciphertext: Vec<u8>,
    pub ephemeral_public_key: Vec<u8>,
    /// HMAC key confirmation over the exchange.
    pub confirmation: Vec<u8>,
}

impl KeyExchangePayload {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Frame::new(FrameType::KeyExchange, encode_payload(self)?)
    }
}

/// Plaintext sealed inside an EncryptedData frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecureRecord {
    /// Application message for the UI layer.
    Message(Vec<u8>),
    Command { code: u8, data: Vec<u8> },
    Response { code: u8, data: Vec<u8> },
    Status { code: u8, data: Vec<u8> },
}

impl SecureRecord {
    pub fn command(code: CommandCode, data: impl Into<Vec<u8>>) -> Self {
        Self::Command {
            code: code.as_byte(),
            data: data.into(),
        }
    }

    pub fn status(code: StatusCode, data: impl Into<Vec<u8>>) -> Self {
        Self::Status {
            code: code.as_byte(),
            data: data.into(),
        }
    }
}

/// Serialize a structured payload with postcard.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(postcard::to_allocvec(value)?)
}

/// Deserialize a structured payload with postcard.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Plaintext `[command, data..]` frame.
pub fn command_frame(code: CommandCode, data: &[u8]) -> Result<Frame, ProtocolError> {
    Frame::with_code(FrameType::Command, code.as_byte(), data)
}

/// Plaintext `[code, data..]` response frame.
pub fn response_frame(code: u8, data: &[u8]) -> Result<Frame, ProtocolError> {
    Frame::with_code(FrameType::Response, code, data)
}

/// Plaintext `[status, data..]` frame.
pub fn status_frame(code: StatusCode, data: &[u8]) -> Result<Frame, ProtocolError> {
    Frame::with_code(FrameType::StatusUpdate, code.as_byte(), data)
}
