use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::events::{DeviceId, DisconnectReason};
use crate::registry::DeviceRegistry;

/// Read size per transport read.
const READ_CHUNK: usize = 4096;

/// Anything a device session can run over: serial bridges, TCP, pipes.
pub trait DeviceTransport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DeviceTransport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A freshly opened device link.
pub struct ConnectedTransport {
    pub stream: Box<dyn DeviceTransport>,
    /// Human-readable origin (address, port name).
    pub label: String,
}

/// Source of device links, i.e. the "request a device" collaborator.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn request_device(&self) -> io::Result<ConnectedTransport>;
}

/// Connects to a serial-over-TCP bridge.
#[derive(Debug, Clone)]
pub struct TcpDeviceProvider {
    addr: String,
    connect_timeout: Duration,
}

impl TcpDeviceProvider {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl DeviceProvider for TcpDeviceProvider {
    async fn request_device(&self) -> io::Result<ConnectedTransport> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", self.addr),
                )
            })??;
        stream.set_nodelay(true)?;
        let label = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.addr.clone());
        info!(peer = %label, "device link opened");
        Ok(ConnectedTransport {
            stream: Box::new(stream),
            label,
        })
    }
}

/// Reader task: transport bytes into the registry until EOF or error.
pub(crate) async fn read_loop<T: DeviceTransport>(
    registry: Arc<DeviceRegistry>,
    device_id: DeviceId,
    mut reader: ReadHalf<T>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.clear();
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                info!(device_id, "device closed the link (EOF)");
                registry.remove(device_id, DisconnectReason::TransportClosed);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(device_id, "transport read error: {}", e);
                registry.remove(device_id, DisconnectReason::TransportError(e.to_string()));
                break;
            }
        }

        if registry.dispatch(device_id, &buf).await.is_err() {
            debug!(device_id, "device gone, stopping reader");
            break;
        }
    }
}

/// Writer task: drains the outbound queue. Ends when every sender is
/// dropped, then shuts the write half down so the peer sees EOF.
pub(crate) async fn write_loop<T: DeviceTransport>(
    registry: Arc<DeviceRegistry>,
    device_id: DeviceId,
    mut writer: WriteHalf<T>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            error!(device_id, "transport write error: {}", e);
            registry.remove(device_id, DisconnectReason::TransportError(e.to_string()));
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(device_id, "transport shutdown: {}", e);
    }
}
