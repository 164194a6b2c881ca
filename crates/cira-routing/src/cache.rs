//! Per-device cache of remote proxies

use std::sync::Arc;

use dashmap::DashMap;

use cira_proto::DeviceId;

use crate::proxy::RemoteProxy;

/// Caches one [`RemoteProxy`] per device on a routing instance.
///
/// The entry API doubles as the per-device critical section: when two
/// lookups race, one proxy wins and the loser is dropped unused.
#[derive(Default)]
pub struct ProxyCache {
    proxies: DashMap<DeviceId, Arc<RemoteProxy>>,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: DeviceId) -> Option<Arc<RemoteProxy>> {
        self.proxies.get(&device_id).map(|entry| entry.value().clone())
    }

    /// Return the cached proxy for a device, inserting the one built by
    /// `make` if none exists. `make` must not touch the cache itself.
    pub fn get_or_insert_with(
        &self,
        device_id: DeviceId,
        make: impl FnOnce() -> Arc<RemoteProxy>,
    ) -> Arc<RemoteProxy> {
        self.proxies
            .entry(device_id)
            .or_insert_with(make)
            .value()
            .clone()
    }

    /// Drop a device's cached proxy. Returns whether one was present.
    pub fn evict(&self, device_id: DeviceId) -> bool {
        self.proxies.remove(&device_id).is_some()
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.proxies.contains_key(&device_id)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn clear(&self) {
        self.proxies.clear()
    }
}
