//! Wire protocol for Phenix devices: framing, checksums and payload types.

pub mod checksum;
pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{encode_frame, FrameCodec, FramingStats};
pub use error::ProtocolError;
pub use messages::{HandshakePayload, KeyExchangePayload, SecureRecord, PROTOCOL_VERSION};
pub use types::{CommandCode, Frame, FrameType, StatusCode};
