//! Two-instance deployment: tunnels terminate on one instance, lookups
//! arrive at another, and channels are brokered between them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::Level;

use cira_broker::{Broker, BrokerError, ConnectionEvent};
use cira_directory::MemoryDirectory;
use cira_forward::{ForwardServer, TcpForwarder};
use cira_proto::{DeviceId, FrameCodec, TunnelFrame};
use cira_routing::ResolveError;

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

/// A tunnel-terminating broker with a forward server in front of its
/// registry, advertising the server's address in its ownership records.
async fn start_owner(instance_id: &str, directory: Arc<MemoryDirectory>) -> Broker {
    let broker = Broker::tunnel_terminating(instance_id, directory);
    let forward = ForwardServer::bind("127.0.0.1:0".parse().unwrap(), broker.registry().clone())
        .await
        .unwrap();
    let forward_addr = forward.local_addr().unwrap();
    tokio::spawn(forward.serve());

    let broker = broker.with_forward_addr(forward_addr.to_string());
    broker.start().await.unwrap();
    broker
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lookup_routes_to_owning_instance() {
    init_tracing();
    let directory = Arc::new(MemoryDirectory::new());

    let owner = start_owner("mps-2", directory.clone()).await;

    let router = Broker::routing_tier("mps-1", directory.clone(), Arc::new(TcpForwarder::new()));
    router.start().await.unwrap();
    let mut router_events = router.subscribe();

    // The device connects to mps-2.
    let device_id = DeviceId::parse("11111111-2222-3333-4444-555555555555").unwrap();
    let (device_side, broker_side) = tokio::io::duplex(64 * 1024);
    tokio::spawn(run_echo_device(device_side));
    owner.tunnel_accepted(device_id, broker_side).await.unwrap();

    // mps-1 learns about it through the directory.
    let event = timeout(Duration::from_secs(5), router_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ConnectionEvent::connected(device_id));
    assert_eq!(router.connected_devices().await, vec![device_id]);

    // A lookup on mps-1 reaches the device through mps-2.
    let connection = router.resolve(device_id).await.unwrap();
    let mut channel = connection.open_channel(16992).await.unwrap();
    channel.send(Bytes::from_static(b"GET /wsman")).await.unwrap();
    let reply = timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[..], b"GET /wsman");
    assert_eq!(
        router.proxy_cache().get(device_id).unwrap().owner_instance(),
        "mps-2"
    );
    drop(channel);

    // The disconnect propagates: retraction reaches the router, the
    // proxy goes away, and lookups stop resolving.
    owner.disconnect_device(device_id).await;

    let event = timeout(Duration::from_secs(5), router_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ConnectionEvent::disconnected(device_id));

    timeout(Duration::from_secs(5), async {
        loop {
            match router.resolve(device_id).await {
                Err(BrokerError::Resolve(ResolveError::NotFound(_))) => break,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .unwrap();
    assert!(router.proxy_cache().is_empty());
    assert!(router.connected_devices().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_device_moves_between_instances() {
    init_tracing();
    let directory = Arc::new(MemoryDirectory::new());

    let owner_a = start_owner("mps-2", directory.clone()).await;
    let owner_b = start_owner("mps-3", directory.clone()).await;

    let router = Broker::routing_tier("mps-1", directory.clone(), Arc::new(TcpForwarder::new()));
    router.start().await.unwrap();

    let device_id = DeviceId::random();
    let (device_side, broker_side) = tokio::io::duplex(64 * 1024);
    tokio::spawn(run_echo_device(device_side));
    owner_a.tunnel_accepted(device_id, broker_side).await.unwrap();

    let connection = router.resolve(device_id).await.unwrap();
    let mut channel = connection.open_channel(16992).await.unwrap();
    channel.send(Bytes::from_static(b"at mps-2")).await.unwrap();
    assert_eq!(
        &timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap()[..],
        b"at mps-2"
    );
    drop(channel);

    // The device drops off mps-2 and reconnects through mps-3.
    owner_a.disconnect_device(device_id).await;
    let (device_side, broker_side) = tokio::io::duplex(64 * 1024);
    tokio::spawn(run_echo_device(device_side));
    owner_b.tunnel_accepted(device_id, broker_side).await.unwrap();

    // The router follows it there, possibly after the takeover event
    // has had a moment to land.
    let mut channel = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(connection) = router.resolve(device_id).await {
                if let Ok(channel) = connection.open_channel(16992).await {
                    return channel;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    channel.send(Bytes::from_static(b"at mps-3")).await.unwrap();
    assert_eq!(
        &timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap()[..],
        b"at mps-3"
    );
    assert_eq!(
        router.proxy_cache().get(device_id).unwrap().owner_instance(),
        "mps-3"
    );
}
