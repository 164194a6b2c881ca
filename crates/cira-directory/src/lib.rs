//! Ownership directory
//!
//! Every instance that terminates tunnels publishes, per connected device,
//! a record naming itself as the owner. Routing instances read those
//! records to find the right peer and watch the event feed to keep their
//! caches honest. The directory is advisory: tunnel handling works without
//! it, lookups across instances do not.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use cira_proto::DeviceId;

pub use memory::MemoryDirectory;
pub use redis::RedisDirectory;

/// Buffer depth for ownership event subscriptions.
pub(crate) const EVENT_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed directory record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Who currently terminates a device's tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnershipRecord {
    /// Instance identifier of the owner.
    pub instance_id: String,
    /// Address where the owner accepts forward connections, if it does.
    pub forward_addr: Option<String>,
    /// When the owner accepted the tunnel.
    pub connected_at: DateTime<Utc>,
}

impl OwnershipRecord {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            forward_addr: None,
            connected_at: Utc::now(),
        }
    }

    pub fn with_forward_addr(mut self, addr: impl Into<String>) -> Self {
        self.forward_addr = Some(addr.into());
        self
    }
}

/// Change notification from the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OwnershipEvent {
    Published {
        device_id: DeviceId,
        record: OwnershipRecord,
    },
    Retracted {
        device_id: DeviceId,
    },
}

/// The shared directory contract.
///
/// `publish` is idempotent for the same owner; publishing a different
/// owner overwrites (last writer wins). `retract` of an absent record is
/// a no-op. `watch` delivers events at least once; subscribers must
/// tolerate lag and events they themselves caused.
#[async_trait]
pub trait OwnershipDirectory: Send + Sync {
    async fn publish(
        &self,
        device_id: DeviceId,
        record: OwnershipRecord,
    ) -> Result<(), DirectoryError>;

    async fn retract(&self, device_id: DeviceId) -> Result<(), DirectoryError>;

    async fn get(&self, device_id: DeviceId) -> Result<Option<OwnershipRecord>, DirectoryError>;

    async fn watch(&self) -> Result<broadcast::Receiver<OwnershipEvent>, DirectoryError>;
}
