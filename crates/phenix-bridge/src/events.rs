//! Typed events handed to the UI layer.

use serde::Serialize;

/// Registry-assigned device handle.
pub type DeviceId = u32;

/// Why a session reached Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    HandshakeTimeout,
    CryptoFailures,
    FramingErrors,
    ProtocolViolation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Local request (`disconnect` or shutdown).
    Requested,
    /// Peer closed the stream.
    TransportClosed,
    TransportError(String),
    Failed(FailureReason),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::TransportClosed => f.write_str("transport closed"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::Failed(reason) => write!(f, "failed: {reason:?}"),
        }
    }
}

/// What happened, without the device it happened to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EventKind {
    DeviceConnected,
    DeviceDisconnected {
        reason: DisconnectReason,
    },
    HandshakeReceived {
        peer_fingerprint: String,
    },
    SecureChannelEstablished {
        session_code: String,
    },
    MessageReceived {
        message: String,
    },
    StatusUpdate {
        status: u8,
        data: Vec<u8>,
    },
    CommandResponse {
        code: u8,
        data: Vec<u8>,
    },
    /// An encrypted frame failed to authenticate; the session stays up
    /// until the failure budget is spent.
    AuthenticationFailure {
        consecutive: u32,
    },
}

/// One entry on the registry's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEvent {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub kind: EventKind,
}
