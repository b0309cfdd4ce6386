//! Registry of connected devices.
//!
//! One entry per device: the session behind a mutex (single writer), the
//! outbound queue feeding its writer task, and the reader task handle. All
//! events leave through one ordered channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn};

use phenix_protocol::codec::FramingStats;
use phenix_protocol::CommandCode;

use crate::events::{DeviceEvent, DeviceId, DisconnectReason, EventKind};
use crate::session::{PeerSession, SessionAction, SessionConfig, SessionError, SessionState};
use crate::transport::{self, DeviceProvider, DeviceTransport};

/// Frames queued per device before senders wait.
const OUTBOUND_QUEUE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Snapshot of one device for UI queries.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub label: String,
    pub state: SessionState,
    pub connected_secs: u64,
    pub idle_secs: u64,
    pub key_fingerprint: String,
    pub session_code: Option<String>,
    pub framing: FramingStats,
}

struct DeviceEntry {
    session: Arc<Mutex<PeerSession>>,
    outbound: mpsc::Sender<Bytes>,
    reader: Option<JoinHandle<()>>,
    label: String,
    connected_at: Instant,
}

fn lock(session: &Mutex<PeerSession>) -> MutexGuard<'_, PeerSession> {
    session.lock().unwrap_or_else(|poisoned| {
        warn!("session mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

pub struct DeviceRegistry {
    devices: DashMap<DeviceId, DeviceEntry>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<DeviceEvent>,
    next_device_id: AtomicU32,
}

impl DeviceRegistry {
    /// Create a registry and the receiving end of its event stream.
    pub fn new(config: SessionConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            devices: DashMap::new(),
            config,
            events,
            next_device_id: AtomicU32::new(1),
        });
        (registry, rx)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Take over a transport: spawn its reader and writer tasks and start
    /// the handshake.
    pub async fn connect<T: DeviceTransport>(
        self: &Arc<Self>,
        transport: T,
        label: impl Into<String>,
    ) -> Result<DeviceId, RegistryError> {
        let device_id = self.next_device_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        let now = Instant::now();

        let mut session = PeerSession::new(self.config.clone(), now);
        let actions = {
            let _span = info_span!("device", device_id).entered();
            session.open(now)?
        };

        let (read_half, write_half) = tokio::io::split(transport);
        let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_LEN);
        tokio::spawn(transport::write_loop(self.clone(), device_id, write_half, rx));

        self.devices.insert(
            device_id,
            DeviceEntry {
                session: Arc::new(Mutex::new(session)),
                outbound: tx,
                reader: None,
                label: label.clone(),
                connected_at: now,
            },
        );
        info!(device_id, peer = %label, "device connected");
        self.emit(device_id, EventKind::DeviceConnected);

        let reader = tokio::spawn(transport::read_loop(self.clone(), device_id, read_half));
        if let Some(mut entry) = self.devices.get_mut(&device_id) {
            entry.reader = Some(reader);
        } else {
            reader.abort();
        }

        self.execute(device_id, actions).await;
        Ok(device_id)
    }

    /// Ask a provider for a device link and connect it.
    pub async fn request_device<P: DeviceProvider + ?Sized>(
        self: &Arc<Self>,
        provider: &P,
    ) -> Result<DeviceId, RegistryError> {
        let link = provider.request_device().await?;
        self.connect(link.stream, link.label).await
    }

    /// Feed bytes received from a device into its session.
    pub async fn dispatch(&self, device_id: DeviceId, data: &[u8]) -> Result<(), RegistryError> {
        let session = self.session(device_id)?;
        let actions = {
            let _span = info_span!("device", device_id).entered();
            lock(&session).handle_bytes(data, Instant::now())
        };
        self.execute(device_id, actions).await;
        Ok(())
    }

    pub async fn send_secure_message(
        &self,
        device_id: DeviceId,
        message: &str,
    ) -> Result<(), RegistryError> {
        self.with_session(device_id, |session, now| {
            session.send_message(message.as_bytes(), now)
        })
        .await
    }

    pub async fn send_command(
        &self,
        device_id: DeviceId,
        code: CommandCode,
        payload: &[u8],
    ) -> Result<(), RegistryError> {
        self.with_session(device_id, |session, now| {
            session.send_command(code, payload, now)
        })
        .await
    }

    /// Rotate the device session's keys and re-run the key exchange.
    pub async fn rekey(&self, device_id: DeviceId) -> Result<(), RegistryError> {
        self.with_session(device_id, |session, now| session.rekey(now))
            .await
    }

    pub fn disconnect(&self, device_id: DeviceId) -> Result<(), RegistryError> {
        if self.remove(device_id, DisconnectReason::Requested) {
            Ok(())
        } else {
            Err(RegistryError::UnknownDevice(device_id))
        }
    }

    /// Drive timers on every session.
    pub async fn tick(&self, now: Instant) {
        for device_id in self.connected_devices() {
            let Ok(session) = self.session(device_id) else {
                continue;
            };
            let actions = {
                let _span = info_span!("device", device_id).entered();
                lock(&session).poll(now)
            };
            self.execute(device_id, actions).await;
        }
    }

    /// Run [`tick`](Self::tick) on a fixed period until the task is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.tick(Instant::now()).await;
            }
        })
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn device_info(&self, device_id: DeviceId) -> Result<DeviceInfo, RegistryError> {
        let entry = self
            .devices
            .get(&device_id)
            .ok_or(RegistryError::UnknownDevice(device_id))?;
        let session = lock(&entry.session);
        Ok(DeviceInfo {
            device_id,
            label: entry.label.clone(),
            state: session.state(),
            connected_secs: entry.connected_at.elapsed().as_secs(),
            idle_secs: session.last_activity().elapsed().as_secs(),
            key_fingerprint: session.local_fingerprint(),
            session_code: session.session_code().map(str::to_owned),
            framing: session.framing_stats(),
        })
    }

    /// Disconnect every device.
    pub fn shutdown(&self) {
        let ids = self.connected_devices();
        info!(devices = ids.len(), "shutting down device registry");
        for device_id in ids {
            self.remove(device_id, DisconnectReason::Requested);
        }
    }

    /// Drop a device: stop its reader, close the session, emit the event.
    /// The writer drains what is queued and exits once the entry is gone.
    pub(crate) fn remove(&self, device_id: DeviceId, reason: DisconnectReason) -> bool {
        let Some((_, entry)) = self.devices.remove(&device_id) else {
            return false;
        };
        if let Some(reader) = &entry.reader {
            reader.abort();
        }
        lock(&entry.session).close();
        info!(device_id, %reason, "device disconnected");
        self.emit(device_id, EventKind::DeviceDisconnected { reason });
        true
    }

    fn session(&self, device_id: DeviceId) -> Result<Arc<Mutex<PeerSession>>, RegistryError> {
        self.devices
            .get(&device_id)
            .map(|entry| entry.session.clone())
            .ok_or(RegistryError::UnknownDevice(device_id))
    }

    async fn with_session<F>(&self, device_id: DeviceId, op: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut PeerSession, Instant) -> Result<Vec<SessionAction>, SessionError>,
    {
        let session = self.session(device_id)?;
        let actions = {
            let _span = info_span!("device", device_id).entered();
            op(&mut *lock(&session), Instant::now())?
        };
        self.execute(device_id, actions).await;
        Ok(())
    }

    fn emit(&self, device_id: DeviceId, kind: EventKind) {
        if self.events.send(DeviceEvent { device_id, kind }).is_err() {
            debug!(device_id, "event receiver dropped");
        }
    }

    /// Carry out session actions. Anything left over for a device that has
    /// been removed meanwhile is discarded.
    async fn execute(&self, device_id: DeviceId, actions: Vec<SessionAction>) {
        for action in actions {
            let outbound = match self.devices.get(&device_id) {
                Some(entry) => entry.outbound.clone(),
                None => {
                    debug!(device_id, "discarding actions for removed device");
                    return;
                }
            };
            match action {
                SessionAction::Send(bytes) => {
                    if outbound.send(bytes).await.is_err() {
                        debug!(device_id, "writer task gone, frame dropped");
                    }
                }
                SessionAction::Emit(kind) => self.emit(device_id, kind),
                SessionAction::Close(reason) => {
                    self.remove(device_id, reason);
                    return;
                }
            }
        }
    }
}
