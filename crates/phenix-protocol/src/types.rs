use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::ProtocolError;

/// Frame types carried in byte 1 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Hybrid public keys + handshake nonce.
    Handshake = 0x01,
    /// Hybrid ciphertext encapsulated to the peer's keys.
    KeyExchange = 0x02,
    /// AES-256-GCM sealed `SecureRecord`.
    EncryptedData = 0x03,
    /// Plaintext status report (`[status, data..]`).
    StatusUpdate = 0x04,
    /// Plaintext command (`[command, data..]`).
    Command = 0x05,
    /// Plaintext command response (`[code, data..]`).
    Response = 0x06,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::KeyExchange),
            0x03 => Ok(Self::EncryptedData),
            0x04 => Ok(Self::StatusUpdate),
            0x05 => Ok(Self::Command),
            0x06 => Ok(Self::Response),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Handshake => "Handshake",
            Self::KeyExchange => "KeyExchange",
            Self::EncryptedData => "EncryptedData",
            Self::StatusUpdate => "StatusUpdate",
            Self::Command => "Command",
            Self::Response => "Response",
        }
    }
}

/// Command sub-codes, first byte of a command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandCode {
    GetStatus = 0x10,
    SendMessage = 0x11,
    Rekey = 0x12,
    Reset = 0x13,
}

impl CommandCode {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x10 => Ok(Self::GetStatus),
            0x11 => Ok(Self::SendMessage),
            0x12 => Ok(Self::Rekey),
            0x13 => Ok(Self::Reset),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Status sub-codes, first byte of a status payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Ready = 0x20,
    Busy = 0x21,
    Error = 0x22,
    Secure = 0x23,
}

impl StatusCode {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x20 => Ok(Self::Ready),
            0x21 => Ok(Self::Busy),
            0x22 => Ok(Self::Error),
            0x23 => Ok(Self::Secure),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One complete protocol frame.
///
/// Length and checksum are derived from the payload, so a `Frame` can never
/// disagree with itself. The codec only hands out frames whose checksum and
/// end marker were verified on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    payload: Bytes,
}

impl Frame {
    /// Build a frame, rejecting payloads that do not fit the u16 length field.
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > u16::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { frame_type, payload })
    }

    /// Build a `[code, data..]` frame (Command, Response, StatusUpdate).
    pub fn with_code(frame_type: FrameType, code: u8, data: &[u8]) -> Result<Self, ProtocolError> {
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(code);
        payload.extend_from_slice(data);
        Self::new(frame_type, payload)
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Declared payload length as written to the wire.
    pub fn length(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn checksum(&self) -> u8 {
        checksum::additive(&self.payload)
    }

    /// Split a `[code, data..]` payload.
    pub fn split_code(&self) -> Result<(u8, &[u8]), ProtocolError> {
        match self.payload.split_first() {
            Some((code, data)) => Ok((*code, data)),
            None => Err(ProtocolError::EmptyPayload(self.frame_type.name())),
        }
    }
}
