//! Logical channels and the connect seam

use std::any::Any;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use cira_proto::DeviceId;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("No open tunnel for device {0}")]
    TunnelClosed(DeviceId),
    #[error("Device {device_id} refused a channel to port {port}")]
    Refused { device_id: DeviceId, port: u16 },
    #[error("Ownership record for device {0} is stale")]
    StaleOwnership(DeviceId),
    #[error("Channel is closed")]
    Closed,
    #[error("Transport error: {0}")]
    Transport(String),
}

/// A bidirectional byte stream to one logical port on a device.
///
/// Dropping the channel closes it; the backing tunnel or forward link
/// notices the sender going away and tells the peer.
pub struct CiraChannel {
    device_id: DeviceId,
    port: u16,
    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,
    _guard: Option<Box<dyn Any + Send + Sync>>,
}

impl CiraChannel {
    pub fn new(
        device_id: DeviceId,
        port: u16,
        outbound: mpsc::Sender<Bytes>,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            device_id,
            port,
            outbound,
            inbound,
            _guard: None,
        }
    }

    /// Attach a value that lives exactly as long as the channel.
    pub fn with_guard(mut self, guard: Box<dyn Any + Send + Sync>) -> Self {
        self._guard = Some(guard);
        self
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send bytes toward the device.
    pub async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        self.outbound
            .send(data)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Receive the next chunk from the device. `None` means the channel
    /// was closed by the other side.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Close the channel. Equivalent to dropping it.
    pub fn close(self) {}
}

impl std::fmt::Debug for CiraChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiraChannel")
            .field("device_id", &self.device_id)
            .field("port", &self.port)
            .finish()
    }
}

/// Anything a channel can be opened against: a locally terminated tunnel
/// or a proxy for a tunnel held by another instance.
#[async_trait]
pub trait Connectable: Send + Sync {
    fn device_id(&self) -> DeviceId;

    async fn open_channel(&self, port: u16) -> Result<CiraChannel, ChannelError>;
}
