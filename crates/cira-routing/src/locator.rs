//! Mode-aware device lookup

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use cira_directory::{DirectoryError, OwnershipDirectory};
use cira_proto::DeviceId;
use cira_tunnel::{Connectable, TunnelRegistry};

use crate::cache::ProxyCache;
use crate::forwarder::ChannelForwarder;
use crate::proxy::RemoteProxy;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No tunnel known for device {0}")]
    NotFound(DeviceId),
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(#[from] DirectoryError),
}

/// Resolves a device id to something channels can be opened on.
///
/// Which arm an instance runs is fixed at startup by its deployment
/// mode; the caller never needs to know whether the tunnel is local.
pub enum ConnectionLocator {
    /// Tunnels terminate here: answer from the local registry.
    TunnelTerminating { registry: Arc<TunnelRegistry> },
    /// Tunnels terminate elsewhere: consult the directory and broker
    /// channels through cached proxies.
    RoutingTier {
        directory: Arc<dyn OwnershipDirectory>,
        cache: Arc<ProxyCache>,
        forwarder: Arc<dyn ChannelForwarder>,
    },
}

impl ConnectionLocator {
    pub fn tunnel_terminating(registry: Arc<TunnelRegistry>) -> Self {
        Self::TunnelTerminating { registry }
    }

    pub fn routing_tier(
        directory: Arc<dyn OwnershipDirectory>,
        cache: Arc<ProxyCache>,
        forwarder: Arc<dyn ChannelForwarder>,
    ) -> Self {
        Self::RoutingTier {
            directory,
            cache,
            forwarder,
        }
    }

    /// Find the connection for a device.
    ///
    /// On the routing tier a directory record is only trusted after the
    /// named owner confirms it still holds the tunnel; a record that
    /// fails the probe resolves to `NotFound` and is not cached, leaving
    /// the record itself for its owner to clean up.
    pub async fn resolve(&self, device_id: DeviceId) -> Result<Arc<dyn Connectable>, ResolveError> {
        match self {
            Self::TunnelTerminating { registry } => {
                let tunnel = registry
                    .lookup(device_id)
                    .await
                    .filter(|tunnel| tunnel.is_open())
                    .ok_or(ResolveError::NotFound(device_id))?;
                Ok(Arc::new(tunnel))
            }
            Self::RoutingTier {
                directory,
                cache,
                forwarder,
            } => {
                if let Some(proxy) = cache.get(device_id) {
                    if proxy.is_invalidated() {
                        cache.evict(device_id);
                    } else {
                        return Ok(proxy);
                    }
                }

                let record = directory
                    .get(device_id)
                    .await?
                    .ok_or(ResolveError::NotFound(device_id))?;

                match forwarder.probe(&record, device_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(
                            device_id = %device_id,
                            owner = %record.instance_id,
                            "Owner no longer holds the tunnel"
                        );
                        return Err(ResolveError::NotFound(device_id));
                    }
                    Err(e) => {
                        warn!(
                            device_id = %device_id,
                            owner = %record.instance_id,
                            "Owner probe failed: {}",
                            e
                        );
                        return Err(ResolveError::NotFound(device_id));
                    }
                }

                let proxy = cache.get_or_insert_with(device_id, || {
                    Arc::new(RemoteProxy::new(
                        device_id,
                        record.clone(),
                        forwarder.clone(),
                        Arc::downgrade(cache),
                    ))
                });
                Ok(proxy)
            }
        }
    }
}
