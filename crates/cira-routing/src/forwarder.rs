//! The seam between routing and the inter-instance transport

use async_trait::async_trait;
use thiserror::Error;

use cira_directory::OwnershipRecord;
use cira_proto::DeviceId;
use cira_tunnel::CiraChannel;

#[derive(Error, Debug)]
pub enum ForwardError {
    /// The owning instance answered but holds no tunnel for the device.
    #[error("Owning instance has no tunnel for the device")]
    UnknownDevice,
    /// The device declined the requested port.
    #[error("Device refused a channel to port {0}")]
    PortRefused(u16),
    /// The owning instance could not be reached at its forward address.
    #[error("Owning instance unreachable: {0}")]
    Unreachable(String),
    /// The peer answered, but not with anything the protocol allows.
    #[error("Forward protocol error: {0}")]
    Protocol(String),
}

/// Opens channels and probes liveness against the instance named in an
/// ownership record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelForwarder: Send + Sync {
    /// Open a channel to `port` on a device whose tunnel the owner holds.
    async fn open_channel(
        &self,
        owner: &OwnershipRecord,
        device_id: DeviceId,
        port: u16,
    ) -> Result<CiraChannel, ForwardError>;

    /// Ask the owner whether it still holds the device's tunnel.
    async fn probe(&self, owner: &OwnershipRecord, device_id: DeviceId)
        -> Result<bool, ForwardError>;
}
