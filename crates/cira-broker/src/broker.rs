//! The broker instance

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cira_directory::{DirectoryError, OwnershipDirectory, OwnershipEvent, OwnershipRecord};
use cira_proto::DeviceId;
use cira_routing::{ChannelForwarder, ConnectionLocator, ProxyCache, ResolveError};
use cira_tunnel::{Connectable, DeviceTunnel, RegistryError, TunnelRegistry};

use crate::events::ConnectionEvent;
use crate::mode::DeploymentMode;

const EVENT_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Instance in {0} mode does not serve lookups")]
    LookupsNotServed(DeploymentMode),
    #[error("Instance in {0} mode does not accept tunnels")]
    TunnelsNotAccepted(DeploymentMode),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// One relay instance.
///
/// A device is either absent (no registry entry) or connected (a
/// registered, open tunnel). The transitions in and out run under a
/// per-device lock, so a reconnecting device replaces its old tunnel
/// without a lookup ever observing both at once, and a teardown racing
/// a reconnect cannot tear down the wrong tunnel.
///
/// Handles are cheap to clone and all refer to the same instance.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    instance_id: String,
    mode: DeploymentMode,
    forward_addr: Mutex<Option<String>>,
    keepalive: Mutex<Option<Duration>>,
    registry: Arc<TunnelRegistry>,
    directory: Arc<dyn OwnershipDirectory>,
    locator: Option<ConnectionLocator>,
    cache: Arc<ProxyCache>,
    events: broadcast::Sender<ConnectionEvent>,
    device_locks: DashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>,
    remote_devices: Mutex<HashSet<DeviceId>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Full instance: terminates tunnels and serves lookups from its own
    /// registry.
    pub fn tunnel_terminating(
        instance_id: impl Into<String>,
        directory: Arc<dyn OwnershipDirectory>,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let locator = ConnectionLocator::tunnel_terminating(registry.clone());
        Self::build(
            instance_id.into(),
            DeploymentMode::TunnelTerminating,
            registry,
            directory,
            Some(locator),
            Arc::new(ProxyCache::new()),
        )
    }

    /// Lookup-only instance: resolves devices through the directory and
    /// brokers channels to their owners through `forwarder`.
    pub fn routing_tier(
        instance_id: impl Into<String>,
        directory: Arc<dyn OwnershipDirectory>,
        forwarder: Arc<dyn ChannelForwarder>,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let cache = Arc::new(ProxyCache::new());
        let locator = ConnectionLocator::routing_tier(directory.clone(), cache.clone(), forwarder);
        Self::build(
            instance_id.into(),
            DeploymentMode::RoutingTier,
            registry,
            directory,
            Some(locator),
            cache,
        )
    }

    /// Tunnel-only instance: terminates tunnels for peers to reach over
    /// the forward server, serves no lookups itself.
    pub fn passive(
        instance_id: impl Into<String>,
        directory: Arc<dyn OwnershipDirectory>,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        Self::build(
            instance_id.into(),
            DeploymentMode::Passive,
            registry,
            directory,
            None,
            Arc::new(ProxyCache::new()),
        )
    }

    fn build(
        instance_id: String,
        mode: DeploymentMode,
        registry: Arc<TunnelRegistry>,
        directory: Arc<dyn OwnershipDirectory>,
        locator: Option<ConnectionLocator>,
        cache: Arc<ProxyCache>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(BrokerInner {
                instance_id,
                mode,
                forward_addr: Mutex::new(None),
                keepalive: Mutex::new(None),
                registry,
                directory,
                locator,
                cache,
                events,
                device_locks: DashMap::new(),
                remote_devices: Mutex::new(HashSet::new()),
                watch_task: Mutex::new(None),
            }),
        }
    }

    /// Address peers should dial to reach tunnels terminated here; goes
    /// into every ownership record this instance publishes.
    pub fn with_forward_addr(self, addr: impl Into<String>) -> Self {
        *self.inner.forward_addr.lock().unwrap() = Some(addr.into());
        self
    }

    /// Probe accepted tunnels at this interval and reap the silent ones.
    pub fn with_keepalive(self, interval: Duration) -> Self {
        *self.inner.keepalive.lock().unwrap() = Some(interval);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn mode(&self) -> DeploymentMode {
        self.inner.mode
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.inner.registry
    }

    pub fn proxy_cache(&self) -> &Arc<ProxyCache> {
        &self.inner.cache
    }

    /// Subscribe to connection events from this instance.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Start mode-specific background work. On the routing tier this
    /// subscribes to directory events so cached proxies and the remote
    /// device view stay current.
    pub async fn start(&self) -> Result<(), BrokerError> {
        if self.inner.mode == DeploymentMode::RoutingTier {
            let events = self.inner.directory.watch().await?;
            let broker = self.clone();
            let task = tokio::spawn(broker.run_watch(events));
            *self.inner.watch_task.lock().unwrap() = Some(task);
        }
        info!(
            instance_id = %self.inner.instance_id,
            mode = %self.inner.mode,
            "Broker started"
        );
        Ok(())
    }

    /// Take over an authenticated device transport.
    ///
    /// Registers the tunnel, publishes ownership, emits the connected
    /// event, and supervises the tunnel until it closes. A device that
    /// is already connected gets its old tunnel replaced.
    pub async fn tunnel_accepted<S>(
        &self,
        device_id: DeviceId,
        stream: S,
    ) -> Result<(), BrokerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.inner.mode.terminates_tunnels() {
            return Err(BrokerError::TunnelsNotAccepted(self.inner.mode));
        }

        let lock = self.device_lock(device_id);
        let result = {
            let _guard = lock.lock().await;
            self.accept_device(device_id, stream).await
        };
        drop(lock);
        self.release_device_lock(device_id);
        result
    }

    /// Resolve a device to something channels can be opened on.
    pub async fn resolve(&self, device_id: DeviceId) -> Result<Arc<dyn Connectable>, BrokerError> {
        let locator = self
            .inner
            .locator
            .as_ref()
            .ok_or(BrokerError::LookupsNotServed(self.inner.mode))?;
        Ok(locator.resolve(device_id).await?)
    }

    /// Devices currently reachable through this instance: locally
    /// terminated tunnels, or on the routing tier the devices seen via
    /// directory events.
    pub async fn connected_devices(&self) -> Vec<DeviceId> {
        match self.inner.mode {
            DeploymentMode::RoutingTier => self
                .inner
                .remote_devices
                .lock()
                .unwrap()
                .iter()
                .copied()
                .collect(),
            _ => self.inner.registry.devices().await,
        }
    }

    /// Administratively disconnect a device. Returns whether a tunnel
    /// was present.
    pub async fn disconnect_device(&self, device_id: DeviceId) -> bool {
        let lock = self.device_lock(device_id);
        let present = {
            let _guard = lock.lock().await;
            self.teardown_device(device_id).await
        };
        drop(lock);
        self.release_device_lock(device_id);
        present
    }

    /// Graceful shutdown: stop watching, close every local tunnel, and
    /// retract the ownership records this instance published.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.watch_task.lock().unwrap().take() {
            task.abort();
        }
        for device_id in self.inner.registry.devices().await {
            let lock = self.device_lock(device_id);
            {
                let _guard = lock.lock().await;
                self.teardown_device(device_id).await;
            }
            drop(lock);
            self.release_device_lock(device_id);
        }
        info!(instance_id = %self.inner.instance_id, "Broker shut down");
    }

    fn device_lock(&self, device_id: DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .device_locks
            .entry(device_id)
            .or_default()
            .value()
            .clone()
    }

    /// Drop a device's transition lock once every task is done with it,
    /// so the lock table does not keep an entry per device ever seen.
    fn release_device_lock(&self, device_id: DeviceId) {
        self.inner
            .device_locks
            .remove_if(&device_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn ownership_record(&self) -> OwnershipRecord {
        let record = OwnershipRecord::new(self.inner.instance_id.clone());
        match self.inner.forward_addr.lock().unwrap().clone() {
            Some(addr) => record.with_forward_addr(addr),
            None => record,
        }
    }

    /// Caller holds the device lock.
    async fn accept_device<S>(&self, device_id: DeviceId, stream: S) -> Result<(), BrokerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.inner.registry.contains(device_id).await {
            info!(device_id = %device_id, "Replacing tunnel for reconnecting device");
            self.teardown_device(device_id).await;
        }

        let keepalive = *self.inner.keepalive.lock().unwrap();
        let tunnel = match keepalive {
            Some(interval) => DeviceTunnel::spawn_with_keepalive(device_id, stream, interval),
            None => DeviceTunnel::spawn(device_id, stream),
        };

        self.inner.registry.register(tunnel.clone()).await?;

        // Ownership publication is best effort: a directory outage must
        // not keep a device from connecting.
        let record = self.ownership_record();
        if let Err(e) = self.inner.directory.publish(device_id, record).await {
            warn!(device_id = %device_id, "Ownership publish failed: {}", e);
        }

        let _ = self.inner.events.send(ConnectionEvent::connected(device_id));
        info!(device_id = %device_id, "Device connected");

        let broker = self.clone();
        let supervised = tunnel;
        tokio::spawn(async move {
            supervised.closed().await;
            broker.device_disconnected(supervised).await;
        });

        Ok(())
    }

    /// Supervision path: a tunnel closed on its own. Tear its device
    /// down unless a replacement already took the registry slot.
    async fn device_disconnected(&self, tunnel: DeviceTunnel) {
        let device_id = tunnel.device_id();
        let lock = self.device_lock(device_id);
        {
            let _guard = lock.lock().await;
            match self.inner.registry.lookup(device_id).await {
                Some(current) if current.same_as(&tunnel) => {
                    self.teardown_device(device_id).await;
                }
                _ => {
                    debug!(device_id = %device_id, "Closed tunnel was already replaced");
                }
            }
        }
        drop(lock);
        self.release_device_lock(device_id);
    }

    /// Unregister, close, retract, evict, notify. Caller holds the
    /// device lock.
    async fn teardown_device(&self, device_id: DeviceId) -> bool {
        let tunnel = match self.inner.registry.unregister(device_id).await {
            Some(tunnel) => tunnel,
            None => return false,
        };
        tunnel.close();

        self.retract_if_owner(device_id).await;
        self.inner.cache.evict(device_id);
        let _ = self
            .inner
            .events
            .send(ConnectionEvent::disconnected(device_id));
        info!(device_id = %device_id, "Device disconnected");
        true
    }

    /// Retract our ownership record, leaving a record a newer owner has
    /// already overwritten alone.
    async fn retract_if_owner(&self, device_id: DeviceId) {
        match self.inner.directory.get(device_id).await {
            Ok(Some(record)) if record.instance_id == self.inner.instance_id => {
                if let Err(e) = self.inner.directory.retract(device_id).await {
                    warn!(device_id = %device_id, "Ownership retract failed: {}", e);
                }
            }
            Ok(_) => {
                debug!(device_id = %device_id, "Skipping retract of record we do not own");
            }
            Err(e) => {
                warn!(device_id = %device_id, "Ownership check failed during retract: {}", e);
            }
        }
    }

    async fn run_watch(self, mut events: broadcast::Receiver<OwnershipEvent>) {
        loop {
            match events.recv().await {
                Ok(OwnershipEvent::Published { device_id, record }) => {
                    let reassigned = self
                        .inner
                        .cache
                        .get(device_id)
                        .map(|proxy| proxy.owner_instance() != record.instance_id)
                        .unwrap_or(false);
                    if reassigned {
                        self.inner.cache.evict(device_id);
                        debug!(
                            device_id = %device_id,
                            new_owner = %record.instance_id,
                            "Evicted proxy for reassigned device"
                        );
                    }
                    self.note_remote_connected(device_id);
                }
                Ok(OwnershipEvent::Retracted { device_id }) => {
                    self.inner.cache.evict(device_id);
                    self.note_remote_disconnected(device_id);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Directory event stream lagged; proxy cache may be stale");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn note_remote_connected(&self, device_id: DeviceId) {
        let inserted = self.inner.remote_devices.lock().unwrap().insert(device_id);
        if inserted {
            let _ = self.inner.events.send(ConnectionEvent::connected(device_id));
        }
    }

    fn note_remote_disconnected(&self, device_id: DeviceId) {
        let removed = self.inner.remote_devices.lock().unwrap().remove(&device_id);
        if removed {
            let _ = self
                .inner
                .events
                .send(ConnectionEvent::disconnected(device_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cira_directory::MemoryDirectory;
    use cira_routing::{ForwardError, RemoteProxy};
    use cira_tunnel::{CiraChannel, TunnelState};
    use tokio::time::timeout;

    struct NoForwarder;

    #[async_trait]
    impl ChannelForwarder for NoForwarder {
        async fn open_channel(
            &self,
            _owner: &OwnershipRecord,
            _device_id: DeviceId,
            _port: u16,
        ) -> Result<CiraChannel, ForwardError> {
            Err(ForwardError::Unreachable("test forwarder".to_string()))
        }

        async fn probe(
            &self,
            _owner: &OwnershipRecord,
            _device_id: DeviceId,
        ) -> Result<bool, ForwardError> {
            Err(ForwardError::Unreachable("test forwarder".to_string()))
        }
    }

    #[tokio::test]
    async fn test_tunnel_accepted_publishes_and_notifies() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::tunnel_terminating("mps-1", directory.clone())
            .with_forward_addr("10.0.0.1:4434");
        let mut events = broker.subscribe();

        let device_id = DeviceId::random();
        let (_device_side, broker_side) = tokio::io::duplex(4096);
        broker.tunnel_accepted(device_id, broker_side).await.unwrap();

        let record = directory.get(device_id).await.unwrap().unwrap();
        assert_eq!(record.instance_id, "mps-1");
        assert_eq!(record.forward_addr.as_deref(), Some("10.0.0.1:4434"));

        let event = events.recv().await.unwrap();
        assert_eq!(event, ConnectionEvent::connected(device_id));
        assert_eq!(broker.connected_devices().await, vec![device_id]);
    }

    #[tokio::test]
    async fn test_transport_loss_retracts_and_notifies() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::tunnel_terminating("mps-1", directory.clone());

        let device_id = DeviceId::random();
        let (device_side, broker_side) = tokio::io::duplex(4096);
        broker.tunnel_accepted(device_id, broker_side).await.unwrap();

        let mut events = broker.subscribe();
        drop(device_side);

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ConnectionEvent::disconnected(device_id));
        assert!(directory.get(device_id).await.unwrap().is_none());
        assert!(broker.connected_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_administrative_disconnect() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::tunnel_terminating("mps-1", directory.clone());

        let device_id = DeviceId::random();
        let (_device_side, broker_side) = tokio::io::duplex(4096);
        broker.tunnel_accepted(device_id, broker_side).await.unwrap();

        assert!(broker.disconnect_device(device_id).await);
        assert!(directory.get(device_id).await.unwrap().is_none());
        assert!(!broker.disconnect_device(device_id).await);
    }

    #[tokio::test]
    async fn test_routing_tier_rejects_tunnels() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::routing_tier("web-1", directory, Arc::new(NoForwarder));

        let (_device_side, broker_side) = tokio::io::duplex(4096);
        let result = broker.tunnel_accepted(DeviceId::random(), broker_side).await;
        assert!(matches!(
            result,
            Err(BrokerError::TunnelsNotAccepted(DeploymentMode::RoutingTier))
        ));
    }

    #[tokio::test]
    async fn test_passive_accepts_tunnels_but_serves_no_lookups() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::passive("mps-passive", directory.clone());

        let device_id = DeviceId::random();
        let (_device_side, broker_side) = tokio::io::duplex(4096);
        broker.tunnel_accepted(device_id, broker_side).await.unwrap();
        assert!(directory.get(device_id).await.unwrap().is_some());

        let result = broker.resolve(device_id).await;
        assert!(matches!(
            result,
            Err(BrokerError::LookupsNotServed(DeploymentMode::Passive))
        ));
    }

    #[tokio::test]
    async fn test_retract_leaves_newer_owner_alone() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::tunnel_terminating("mps-1", directory.clone());

        let device_id = DeviceId::random();
        let (_device_side, broker_side) = tokio::io::duplex(4096);
        broker.tunnel_accepted(device_id, broker_side).await.unwrap();

        // The device has meanwhile reconnected through another instance.
        directory
            .publish(device_id, OwnershipRecord::new("mps-2"))
            .await
            .unwrap();

        broker.disconnect_device(device_id).await;

        let record = directory.get(device_id).await.unwrap().unwrap();
        assert_eq!(record.instance_id, "mps-2");
    }

    #[tokio::test]
    async fn test_duplicate_connect_replaces_tunnel() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::tunnel_terminating("mps-1", directory.clone());

        let device_id = DeviceId::random();
        let (_old_device, old_side) = tokio::io::duplex(4096);
        broker.tunnel_accepted(device_id, old_side).await.unwrap();
        let old_tunnel = broker.registry().lookup(device_id).await.unwrap();

        let mut events = broker.subscribe();
        let (_new_device, new_side) = tokio::io::duplex(4096);
        broker.tunnel_accepted(device_id, new_side).await.unwrap();

        assert_eq!(old_tunnel.state(), TunnelState::Closed);
        let current = broker.registry().lookup(device_id).await.unwrap();
        assert!(!current.same_as(&old_tunnel));
        assert!(current.is_open());

        let first = events.recv().await.unwrap();
        assert_eq!(first, ConnectionEvent::disconnected(device_id));
        let second = events.recv().await.unwrap();
        assert_eq!(second, ConnectionEvent::connected(device_id));

        assert_eq!(
            directory.get(device_id).await.unwrap().unwrap().instance_id,
            "mps-1"
        );
        assert_eq!(broker.connected_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_retracts_everything() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::tunnel_terminating("mps-1", directory.clone());

        let mut device_sides = Vec::new();
        for _ in 0..3 {
            let device_id = DeviceId::random();
            let (device_side, broker_side) = tokio::io::duplex(4096);
            device_sides.push(device_side);
            broker.tunnel_accepted(device_id, broker_side).await.unwrap();
        }
        assert_eq!(directory.len().await, 3);

        broker.shutdown().await;
        assert!(directory.is_empty().await);
        assert!(broker.connected_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_device_locks_do_not_accumulate() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::tunnel_terminating("mps-1", directory);

        let mut device_sides = Vec::new();
        for _ in 0..4 {
            let device_id = DeviceId::random();
            let (device_side, broker_side) = tokio::io::duplex(4096);
            device_sides.push(device_side);
            broker.tunnel_accepted(device_id, broker_side).await.unwrap();
            broker.disconnect_device(device_id).await;
        }
        assert_eq!(broker.registry().count().await, 0);

        // The supervisors take the lock once more after the close; the
        // table drains once they finish.
        timeout(Duration::from_secs(5), async {
            while !broker.inner.device_locks.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_routing_tier_tracks_remote_devices() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::routing_tier("web-1", directory.clone(), Arc::new(NoForwarder));
        broker.start().await.unwrap();
        let mut events = broker.subscribe();

        let device_id = DeviceId::random();
        directory
            .publish(device_id, OwnershipRecord::new("mps-2"))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ConnectionEvent::connected(device_id));
        assert_eq!(broker.connected_devices().await, vec![device_id]);

        directory.retract(device_id).await.unwrap();
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ConnectionEvent::disconnected(device_id));
        assert!(broker.connected_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_takeover_evicts_cached_proxy() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Broker::routing_tier("web-1", directory.clone(), Arc::new(NoForwarder));
        broker.start().await.unwrap();
        let mut events = broker.subscribe();

        let device_id = DeviceId::random();
        directory
            .publish(device_id, OwnershipRecord::new("mps-2"))
            .await
            .unwrap();
        timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();

        let cache = broker.proxy_cache().clone();
        cache.get_or_insert_with(device_id, || {
            Arc::new(RemoteProxy::new(
                device_id,
                OwnershipRecord::new("mps-2"),
                Arc::new(NoForwarder),
                Arc::downgrade(&cache),
            ))
        });

        // Ownership moves to another instance; the proxy must go.
        directory
            .publish(device_id, OwnershipRecord::new("mps-3"))
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            while cache.contains(device_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
