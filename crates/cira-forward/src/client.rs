//! Requesting side of the forward protocol

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use cira_directory::OwnershipRecord;
use cira_proto::{DeviceId, ForwardMessage, FrameCodec, RejectReason, CHANNEL_BUFFER};
use cira_routing::{ChannelForwarder, ForwardError};
use cira_tunnel::CiraChannel;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens brokered channels over TCP against the forward address in an
/// ownership record.
pub struct TcpForwarder {
    connect_timeout: Duration,
    reply_timeout: Duration,
}

impl TcpForwarder {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    async fn connect(
        &self,
        owner: &OwnershipRecord,
    ) -> Result<Framed<TcpStream, FrameCodec<ForwardMessage>>, ForwardError> {
        let addr = owner.forward_addr.as_deref().ok_or_else(|| {
            ForwardError::Protocol("ownership record has no forward address".to_string())
        })?;

        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ForwardError::Unreachable(format!("connect to {} timed out", addr)))?
            .map_err(|e| ForwardError::Unreachable(format!("connect to {} failed: {}", addr, e)))?;

        Ok(Framed::new(stream, FrameCodec::<ForwardMessage>::new()))
    }
}

impl Default for TcpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelForwarder for TcpForwarder {
    async fn open_channel(
        &self,
        owner: &OwnershipRecord,
        device_id: DeviceId,
        port: u16,
    ) -> Result<CiraChannel, ForwardError> {
        let mut framed = self.connect(owner).await?;

        framed
            .send(ForwardMessage::OpenRequest { device_id, port })
            .await
            .map_err(|e| ForwardError::Unreachable(e.to_string()))?;

        let reply = timeout(self.reply_timeout, framed.next())
            .await
            .map_err(|_| ForwardError::Unreachable("channel open timed out".to_string()))?;

        match reply {
            Some(Ok(ForwardMessage::OpenAccepted)) => {
                let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);
                let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER);
                tokio::spawn(pump(framed, in_tx, out_rx));
                Ok(CiraChannel::new(device_id, port, out_tx, in_rx))
            }
            Some(Ok(ForwardMessage::OpenRejected { reason })) => Err(match reason {
                RejectReason::PortRefused => ForwardError::PortRefused(port),
                RejectReason::UnknownDevice | RejectReason::TunnelClosing => {
                    ForwardError::UnknownDevice
                }
            }),
            Some(Ok(other)) => Err(ForwardError::Protocol(format!(
                "unexpected open reply: {:?}",
                other
            ))),
            Some(Err(e)) => Err(ForwardError::Protocol(e.to_string())),
            None => Err(ForwardError::Unreachable(
                "connection closed during open".to_string(),
            )),
        }
    }

    async fn probe(
        &self,
        owner: &OwnershipRecord,
        device_id: DeviceId,
    ) -> Result<bool, ForwardError> {
        let mut framed = self.connect(owner).await?;

        framed
            .send(ForwardMessage::Probe { device_id })
            .await
            .map_err(|e| ForwardError::Unreachable(e.to_string()))?;

        let reply = timeout(self.reply_timeout, framed.next())
            .await
            .map_err(|_| ForwardError::Unreachable("probe timed out".to_string()))?;

        match reply {
            Some(Ok(ForwardMessage::ProbeResult { attached })) => Ok(attached),
            Some(Ok(other)) => Err(ForwardError::Protocol(format!(
                "unexpected probe reply: {:?}",
                other
            ))),
            Some(Err(e)) => Err(ForwardError::Protocol(e.to_string())),
            None => Err(ForwardError::Unreachable(
                "connection closed during probe".to_string(),
            )),
        }
    }
}

/// Client half of the channel pump. Mirrors the server side: `Data` in
/// both directions, `Close` or socket teardown ends the channel.
async fn pump(
    mut framed: Framed<TcpStream, FrameCodec<ForwardMessage>>,
    in_tx: mpsc::Sender<Bytes>,
    mut out_rx: mpsc::Receiver<Bytes>,
) {
    loop {
        tokio::select! {
            message = framed.next() => {
                match message {
                    Some(Ok(ForwardMessage::Data { payload })) => {
                        if in_tx.send(Bytes::from(payload)).await.is_err() {
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
            chunk = out_rx.recv() => {
                match chunk {
                    Some(data) => {
                        let message = ForwardMessage::Data { payload: data.to_vec() };
                        if framed.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Channel handle dropped; tell the owner.
                        let _ = framed.send(ForwardMessage::Close).await;
                        break;
                    }
                }
            }
        }
    }
}
