//! Proxy for a tunnel terminated by another instance

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};

use cira_directory::OwnershipRecord;
use cira_proto::DeviceId;
use cira_tunnel::{ChannelError, CiraChannel, Connectable};

use crate::cache::ProxyCache;
use crate::forwarder::{ChannelForwarder, ForwardError};

/// Stands in for a device whose tunnel lives on another instance.
///
/// The proxy pins the ownership record it was resolved from. When the
/// owner turns out not to hold the tunnel anymore, the proxy invalidates
/// itself and drops out of the cache, so the next lookup consults the
/// directory again.
pub struct RemoteProxy {
    device_id: DeviceId,
    owner: OwnershipRecord,
    forwarder: Arc<dyn ChannelForwarder>,
    cache: Weak<ProxyCache>,
    invalidated: AtomicBool,
    brokered: Arc<AtomicUsize>,
}

/// Decrements the proxy's channel count when a brokered channel drops.
struct BrokeredGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for BrokeredGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl RemoteProxy {
    pub fn new(
        device_id: DeviceId,
        owner: OwnershipRecord,
        forwarder: Arc<dyn ChannelForwarder>,
        cache: Weak<ProxyCache>,
    ) -> Self {
        Self {
            device_id,
            owner,
            forwarder,
            cache,
            invalidated: AtomicBool::new(false),
            brokered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn owner(&self) -> &OwnershipRecord {
        &self.owner
    }

    pub fn owner_instance(&self) -> &str {
        &self.owner.instance_id
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Channels currently brokered through this proxy.
    pub fn brokered_channels(&self) -> usize {
        self.brokered.load(Ordering::Relaxed)
    }

    /// Mark the pinned ownership record stale and drop out of the cache.
    pub fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.evict(self.device_id);
        }
        debug!(
            device_id = %self.device_id,
            owner = %self.owner.instance_id,
            "Ownership record invalidated"
        );
    }
}

#[async_trait]
impl Connectable for RemoteProxy {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    async fn open_channel(&self, port: u16) -> Result<CiraChannel, ChannelError> {
        if self.is_invalidated() {
            return Err(ChannelError::StaleOwnership(self.device_id));
        }

        match self
            .forwarder
            .open_channel(&self.owner, self.device_id, port)
            .await
        {
            Ok(channel) => {
                self.brokered.fetch_add(1, Ordering::Relaxed);
                let guard = BrokeredGuard {
                    counter: self.brokered.clone(),
                };
                Ok(channel.with_guard(Box::new(guard)))
            }
            Err(ForwardError::UnknownDevice) => {
                self.invalidate();
                Err(ChannelError::StaleOwnership(self.device_id))
            }
            Err(ForwardError::Unreachable(reason)) => {
                warn!(
                    device_id = %self.device_id,
                    owner = %self.owner.instance_id,
                    "Owning instance unreachable: {}",
                    reason
                );
                self.invalidate();
                Err(ChannelError::StaleOwnership(self.device_id))
            }
            Err(ForwardError::PortRefused(port)) => Err(ChannelError::Refused {
                device_id: self.device_id,
                port,
            }),
            Err(ForwardError::Protocol(reason)) => Err(ChannelError::Transport(reason)),
        }
    }
}
