//! Registry of locally terminated tunnels

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use cira_proto::DeviceId;

use crate::tunnel::DeviceTunnel;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Device {0} already has a registered tunnel")]
    AlreadyRegistered(DeviceId),
}

/// Tracks which device tunnels this instance currently terminates.
///
/// The registry holds handles, not the tunnels themselves: unregistering
/// does not close a tunnel, and a tunnel closing does not unregister it.
/// The broker layer keeps the two in step.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<DeviceId, DeviceTunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel for a device. Fails if the device already has
    /// one; callers decide whether to replace it first.
    pub async fn register(&self, tunnel: DeviceTunnel) -> Result<(), RegistryError> {
        let device_id = tunnel.device_id();
        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(&device_id) {
            return Err(RegistryError::AlreadyRegistered(device_id));
        }
        tunnels.insert(device_id, tunnel);
        info!(device_id = %device_id, total = tunnels.len(), "Tunnel registered");
        Ok(())
    }

    /// Look up the tunnel for a device, if one is registered.
    pub async fn lookup(&self, device_id: DeviceId) -> Option<DeviceTunnel> {
        self.tunnels.read().await.get(&device_id).cloned()
    }

    /// Remove a device's tunnel from the registry, returning the handle.
    pub async fn unregister(&self, device_id: DeviceId) -> Option<DeviceTunnel> {
        let mut tunnels = self.tunnels.write().await;
        let removed = tunnels.remove(&device_id);
        if removed.is_some() {
            debug!(device_id = %device_id, total = tunnels.len(), "Tunnel unregistered");
        }
        removed
    }

    pub async fn contains(&self, device_id: DeviceId) -> bool {
        self.tunnels.read().await.contains_key(&device_id)
    }

    /// Devices with a registered tunnel, in no particular order.
    pub async fn devices(&self) -> Vec<DeviceId> {
        self.tunnels.read().await.keys().copied().collect()
    }

    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }
}
