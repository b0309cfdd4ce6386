//! Phenix device bridge: per-device secure sessions over byte-stream
//! transports, a registry that owns them, and the event stream the UI
//! layer consumes.

pub mod commands;
pub mod config;
pub mod events;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::BridgeConfig;
pub use events::{DeviceEvent, DeviceId, DisconnectReason, EventKind, FailureReason};
pub use registry::{DeviceInfo, DeviceRegistry, RegistryError};
pub use session::{PeerSession, SessionAction, SessionConfig, SessionError, SessionState};
pub use transport::{ConnectedTransport, DeviceProvider, DeviceTransport, TcpDeviceProvider};
