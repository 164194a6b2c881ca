//! Connection notifications

use serde::{Deserialize, Serialize};

use cira_proto::DeviceId;

/// Emitted when a device becomes reachable or stops being reachable
/// through this instance. The serialized shape is what downstream
/// consumers of the relay expect on their message bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub device_id: DeviceId,
    pub event: EventKind,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "node_connection")]
    NodeConnection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionEvent {
    pub fn connected(device_id: DeviceId) -> Self {
        Self {
            device_id,
            event: EventKind::NodeConnection,
            status: ConnectionStatus::Connected,
        }
    }

    pub fn disconnected(device_id: DeviceId) -> Self {
        Self {
            device_id,
            event: EventKind::NodeConnection,
            status: ConnectionStatus::Disconnected,
        }
    }
}
