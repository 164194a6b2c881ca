//! In-process directory for single-instance deployments and tests

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use cira_proto::DeviceId;

use crate::{DirectoryError, OwnershipDirectory, OwnershipEvent, OwnershipRecord, EVENT_BUFFER};

/// Directory backed by a process-local map. Useful as the backend for a
/// standalone deployment and as the shared directory in tests, where
/// several brokers can hold an `Arc` to the same instance.
pub struct MemoryDirectory {
    records: RwLock<HashMap<DeviceId, OwnershipRecord>>,
    events: broadcast::Sender<OwnershipEvent>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            records: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OwnershipDirectory for MemoryDirectory {
    async fn publish(
        &self,
        device_id: DeviceId,
        record: OwnershipRecord,
    ) -> Result<(), DirectoryError> {
        let event = {
            let mut records = self.records.write().await;
            let same_owner = records
                .get(&device_id)
                .map(|existing| existing.instance_id == record.instance_id)
                .unwrap_or(false);
            records.insert(device_id, record.clone());
            if same_owner {
                None
            } else {
                Some(OwnershipEvent::Published { device_id, record })
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn retract(&self, device_id: DeviceId) -> Result<(), DirectoryError> {
        let removed = self.records.write().await.remove(&device_id).is_some();
        if removed {
            let _ = self.events.send(OwnershipEvent::Retracted { device_id });
        } else {
            debug!(device_id = %device_id, "Retract of absent record ignored");
        }
        Ok(())
    }

    async fn get(&self, device_id: DeviceId) -> Result<Option<OwnershipRecord>, DirectoryError> {
        Ok(self.records.read().await.get(&device_id).cloned())
    }

    async fn watch(&self) -> Result<broadcast::Receiver<OwnershipEvent>, DirectoryError> {
        Ok(self.events.subscribe())
    }
}
