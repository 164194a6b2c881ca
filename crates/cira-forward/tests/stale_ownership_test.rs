//! Stale ownership records discovered and healed through real forwarding.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::Level;

use cira_directory::{MemoryDirectory, OwnershipDirectory, OwnershipRecord};
use cira_forward::{ForwardServer, TcpForwarder};
use cira_proto::{DeviceId, FrameCodec, TunnelFrame};
use cira_routing::{ConnectionLocator, ProxyCache, ResolveError};
use cira_tunnel::{ChannelError, DeviceTunnel, TunnelRegistry};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

async fn run_echo_device<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(stream, FrameCodec::<TunnelFrame>::new());
    while let Some(Ok(frame)) = framed.next().await {
        match frame {
            TunnelFrame::OpenChannel { channel_id, .. } => {
                if framed
                    .send(TunnelFrame::OpenConfirm { channel_id })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            TunnelFrame::Data {
                channel_id,
                payload,
            } => {
                let echo = TunnelFrame::Data {
                    channel_id,
                    payload,
                };
                if framed.send(echo).await.is_err() {
                    return;
                }
            }
            TunnelFrame::Keepalive => {
                if framed.send(TunnelFrame::KeepaliveAck).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

struct OwnerInstance {
    registry: Arc<TunnelRegistry>,
    tunnel: DeviceTunnel,
    record: OwnershipRecord,
    server: tokio::task::JoinHandle<()>,
}

async fn start_owner(instance_id: &str, device_id: DeviceId) -> OwnerInstance {
    let registry = Arc::new(TunnelRegistry::new());
    let (device_side, broker_side) = tokio::io::duplex(64 * 1024);
    tokio::spawn(run_echo_device(device_side));
    let tunnel = DeviceTunnel::spawn(device_id, broker_side);
    registry.register(tunnel.clone()).await.unwrap();

    let server = ForwardServer::bind("127.0.0.1:0".parse().unwrap(), registry.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let server = tokio::spawn(server.serve());

    let record = OwnershipRecord::new(instance_id).with_forward_addr(addr.to_string());
    OwnerInstance {
        registry,
        tunnel,
        record,
        server,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_record_invalidates_and_recovers() {
    init_tracing();
    let device_id = DeviceId::random();
    let directory = Arc::new(MemoryDirectory::new());

    let owner_a = start_owner("mps-2", device_id).await;
    directory
        .publish(device_id, owner_a.record.clone())
        .await
        .unwrap();

    let cache = Arc::new(ProxyCache::new());
    let locator = ConnectionLocator::routing_tier(
        directory.clone(),
        cache.clone(),
        Arc::new(TcpForwarder::new()),
    );

    // While the record is accurate, channels flow.
    let connection = locator.resolve(device_id).await.unwrap();
    let mut channel = connection.open_channel(16992).await.unwrap();
    channel.send(Bytes::from_static(b"ping")).await.unwrap();
    let reply = timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[..], b"ping");
    drop(channel);

    // The owner loses the tunnel; its directory record lingers.
    owner_a.registry.unregister(device_id).await;
    owner_a.tunnel.close();

    let connection = locator.resolve(device_id).await.unwrap();
    let result = connection.open_channel(16992).await;
    if let Err(ChannelError::StaleOwnership(id)) = result {
        assert_eq!(id, device_id);
    } else {
        panic!("Expected StaleOwnership error");
    }
    assert!(!cache.contains(device_id));

    // Fresh lookups now fail the probe against the lingering record and
    // cache nothing.
    let result = locator.resolve(device_id).await;
    assert!(matches!(result, Err(ResolveError::NotFound(_))));
    assert!(cache.is_empty());

    // The device reconnects through another instance.
    let owner_b = start_owner("mps-3", device_id).await;
    directory
        .publish(device_id, owner_b.record.clone())
        .await
        .unwrap();

    let connection = locator.resolve(device_id).await.unwrap();
    let mut channel = connection.open_channel(16992).await.unwrap();
    channel.send(Bytes::from_static(b"hello again")).await.unwrap();
    let reply = timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[..], b"hello again");
    assert_eq!(cache.get(device_id).unwrap().owner_instance(), "mps-3");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dead_instance_detected_on_open() {
    init_tracing();
    let device_id = DeviceId::random();
    let directory = Arc::new(MemoryDirectory::new());

    let owner = start_owner("mps-2", device_id).await;
    directory
        .publish(device_id, owner.record.clone())
        .await
        .unwrap();

    let cache = Arc::new(ProxyCache::new());
    let locator = ConnectionLocator::routing_tier(
        directory.clone(),
        cache.clone(),
        Arc::new(TcpForwarder::new()),
    );
    let connection = locator.resolve(device_id).await.unwrap();

    // The whole instance goes away, forward listener included.
    owner.server.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = connection.open_channel(16992).await;
    assert!(matches!(result, Err(ChannelError::StaleOwnership(_))));
    assert!(!cache.contains(device_id));
}
