//! Answering side of the forward protocol

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use cira_proto::{DeviceId, ForwardMessage, FrameCodec, RejectReason};
use cira_tunnel::{ChannelError, CiraChannel, TunnelRegistry};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts forward connections from peer instances and serves them from
/// the local tunnel registry.
pub struct ForwardServer {
    listener: TcpListener,
    registry: Arc<TunnelRegistry>,
}

impl ForwardServer {
    pub async fn bind(addr: SocketAddr, registry: Arc<TunnelRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Forward server listening");
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "Forward connection accepted");
                    let registry = self.registry.clone();
                    tokio::spawn(handle_forward_connection(socket, registry));
                }
                Err(e) => {
                    warn!("Forward accept failed: {}", e);
                }
            }
        }
    }
}

async fn handle_forward_connection(socket: TcpStream, registry: Arc<TunnelRegistry>) {
    let mut framed = Framed::new(socket, FrameCodec::<ForwardMessage>::new());

    let first = match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(e))) => {
            debug!("Forward handshake failed: {}", e);
            return;
        }
        Ok(None) => return,
        Err(_) => {
            debug!("Forward handshake timed out");
            return;
        }
    };

    match first {
        ForwardMessage::Probe { device_id } => {
            let attached = registry
                .lookup(device_id)
                .await
                .map(|tunnel| tunnel.is_open())
                .unwrap_or(false);
            let _ = framed.send(ForwardMessage::ProbeResult { attached }).await;
        }
        ForwardMessage::OpenRequest { device_id, port } => {
            handle_open_request(framed, registry, device_id, port).await;
        }
        other => {
            debug!(?other, "Unexpected first forward message");
        }
    }
}

async fn handle_open_request(
    mut framed: Framed<TcpStream, FrameCodec<ForwardMessage>>,
    registry: Arc<TunnelRegistry>,
    device_id: DeviceId,
    port: u16,
) {
    let tunnel = match registry.lookup(device_id).await {
        Some(tunnel) => tunnel,
        None => {
            let _ = framed
                .send(ForwardMessage::OpenRejected {
                    reason: RejectReason::UnknownDevice,
                })
                .await;
            return;
        }
    };

    let channel = match tunnel.open_channel(port).await {
        Ok(channel) => channel,
        Err(ChannelError::Refused { .. }) => {
            let _ = framed
                .send(ForwardMessage::OpenRejected {
                    reason: RejectReason::PortRefused,
                })
                .await;
            return;
        }
        Err(ChannelError::TunnelClosed(_)) => {
            let _ = framed
                .send(ForwardMessage::OpenRejected {
                    reason: RejectReason::TunnelClosing,
                })
                .await;
            return;
        }
        Err(e) => {
            warn!(device_id = %device_id, "Brokered channel open failed: {}", e);
            let _ = framed
                .send(ForwardMessage::OpenRejected {
                    reason: RejectReason::TunnelClosing,
                })
                .await;
            return;
        }
    };

    if framed.send(ForwardMessage::OpenAccepted).await.is_err() {
        return;
    }
    debug!(device_id = %device_id, port, "Brokering channel for peer");
    pump(framed, channel).await;
}

/// Shovel bytes between the forward socket and the device channel until
/// either side closes.
async fn pump(mut framed: Framed<TcpStream, FrameCodec<ForwardMessage>>, mut channel: CiraChannel) {
    loop {
        tokio::select! {
            message = framed.next() => {
                match message {
                    Some(Ok(ForwardMessage::Data { payload })) => {
                        if channel.send(Bytes::from(payload)).await.is_err() {
                            let _ = framed.send(ForwardMessage::Close).await;
                            break;
                        }
                    }
                    Some(Ok(ForwardMessage::Close)) | None => break,
                    Some(Ok(other)) => {
                        debug!(?other, "Unexpected forward message mid-channel");
                    }
                    Some(Err(e)) => {
                        debug!("Forward read failed: {}", e);
                        break;
                    }
                }
            }
            chunk = channel.recv() => {
                match chunk {
                    Some(data) => {
                        let message = ForwardMessage::Data { payload: data.to_vec() };
                        if framed.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = framed.send(ForwardMessage::Close).await;
                        break;
                    }
                }
            }
        }
    }
}
