//! One device-initiated tunnel and the channels multiplexed over it
//!
//! A tunnel owns its transport through two pump tasks: a read loop that
//! dispatches inbound frames and a write loop that drains a shared frame
//! queue into the socket. Channel state lives behind the shared inner so
//! every clone of the handle sees the same tunnel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use cira_proto::{DeviceId, FrameCodec, RejectReason, TunnelFrame, CHANNEL_BUFFER};

use crate::channel::{ChannelError, CiraChannel, Connectable};

/// Outbound frame queue depth, shared by all channels on one tunnel.
const FRAME_QUEUE: usize = 256;

/// How long to wait for the device to answer an `OpenChannel`.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Accepting new channels.
    Open,
    /// Draining: existing channels run, new opens are refused.
    Closing,
    /// Torn down.
    Closed,
}

/// Handle to a live device tunnel. Cheap to clone; all clones refer to
/// the same underlying connection.
#[derive(Clone)]
pub struct DeviceTunnel {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    device_id: DeviceId,
    state: Mutex<TunnelState>,
    channels: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<(), RejectReason>>>>,
    next_channel_id: AtomicU32,
    frames_tx: mpsc::Sender<TunnelFrame>,
    closed_tx: watch::Sender<bool>,
    last_seen: AtomicI64,
}

impl DeviceTunnel {
    /// Take ownership of an accepted transport and start the pump tasks.
    pub fn spawn<S>(device_id: DeviceId, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn_inner(device_id, stream, None)
    }

    /// Like [`DeviceTunnel::spawn`], additionally probing the device at
    /// `interval` and tearing the tunnel down when nothing has been heard
    /// for two intervals.
    pub fn spawn_with_keepalive<S>(device_id: DeviceId, stream: S, interval: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn_inner(device_id, stream, Some(interval))
    }

    fn spawn_inner<S>(device_id: DeviceId, stream: S, keepalive: Option<Duration>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let framed_read = FramedRead::new(read_half, FrameCodec::<TunnelFrame>::new());
        let framed_write = FramedWrite::new(write_half, FrameCodec::<TunnelFrame>::new());

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(TunnelInner {
            device_id,
            state: Mutex::new(TunnelState::Open),
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU32::new(1),
            frames_tx,
            closed_tx,
            last_seen: AtomicI64::new(Utc::now().timestamp_millis()),
        });

        tokio::spawn(TunnelInner::read_loop(inner.clone(), framed_read));
        tokio::spawn(TunnelInner::write_loop(inner.clone(), framed_write, frames_rx));
        if let Some(interval) = keepalive {
            tokio::spawn(TunnelInner::keepalive_loop(inner.clone(), interval));
        }

        Self { inner }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    pub fn state(&self) -> TunnelState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state() == TunnelState::Open
    }

    /// Number of channels currently open on this tunnel.
    pub fn active_channels(&self) -> usize {
        self.inner.channels.lock().unwrap().len()
    }

    /// Whether two handles refer to the same underlying tunnel.
    pub fn same_as(&self, other: &DeviceTunnel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open a logical channel to `port` on the device.
    pub async fn open_channel(&self, port: u16) -> Result<CiraChannel, ChannelError> {
        let inner = &self.inner;
        if inner.state() != TunnelState::Open {
            return Err(ChannelError::TunnelClosed(inner.device_id));
        }

        let channel_id = inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (confirm_tx, confirm_rx) = oneshot::channel();

        // Register before the request goes out so an early payload from a
        // fast device still has somewhere to land.
        inner.channels.lock().unwrap().insert(channel_id, data_tx);
        inner.pending.lock().unwrap().insert(channel_id, confirm_tx);

        let request = TunnelFrame::OpenChannel { channel_id, port };
        if inner.frames_tx.send(request).await.is_err() {
            inner.remove_channel(channel_id);
            inner.pending.lock().unwrap().remove(&channel_id);
            return Err(ChannelError::TunnelClosed(inner.device_id));
        }

        match timeout(OPEN_TIMEOUT, confirm_rx).await {
            Ok(Ok(Ok(()))) => {
                let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);
                TunnelInner::spawn_channel_egress(inner.clone(), channel_id, out_rx);
                trace!(device_id = %inner.device_id, channel_id, port, "Channel opened");
                Ok(CiraChannel::new(inner.device_id, port, out_tx, data_rx))
            }
            Ok(Ok(Err(RejectReason::PortRefused))) => Err(ChannelError::Refused {
                device_id: inner.device_id,
                port,
            }),
            Ok(Ok(Err(_))) => Err(ChannelError::TunnelClosed(inner.device_id)),
            Ok(Err(_)) => {
                // Pending map was drained by teardown.
                Err(ChannelError::TunnelClosed(inner.device_id))
            }
            Err(_) => {
                inner.remove_channel(channel_id);
                inner.pending.lock().unwrap().remove(&channel_id);
                Err(ChannelError::Transport("channel open timed out".to_string()))
            }
        }
    }

    /// Stop accepting channel opens; the tunnel tears down once the last
    /// open channel closes. A tunnel with no channels closes immediately.
    pub fn mark_closing(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != TunnelState::Open {
                return;
            }
            *state = TunnelState::Closing;
        }
        if self.inner.channels.lock().unwrap().is_empty() {
            self.inner.close_all("closing with no channels");
        }
    }

    /// Tear the tunnel down now, dropping any open channels.
    pub fn close(&self) {
        self.inner.close_all("closed by broker");
    }

    /// Resolves once the tunnel has fully closed, whatever the cause.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Connectable for DeviceTunnel {
    fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    async fn open_channel(&self, port: u16) -> Result<CiraChannel, ChannelError> {
        DeviceTunnel::open_channel(self, port).await
    }
}

impl TunnelInner {
    fn state(&self) -> TunnelState {
        *self.state.lock().unwrap()
    }

    fn touch(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Remove a channel entry. Returns whether the entry existed. Closes
    /// the tunnel when the last channel of a draining tunnel goes away.
    fn remove_channel(&self, channel_id: u32) -> bool {
        let (removed, empty) = {
            let mut channels = self.channels.lock().unwrap();
            let removed = channels.remove(&channel_id).is_some();
            (removed, channels.is_empty())
        };
        if removed && empty && self.state() == TunnelState::Closing {
            self.close_all("last channel closed");
        }
        removed
    }

    /// Terminal teardown. Idempotent.
    fn close_all(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == TunnelState::Closed {
                return;
            }
            *state = TunnelState::Closed;
        }
        self.channels.lock().unwrap().clear();
        self.pending.lock().unwrap().clear();
        self.closed_tx.send_replace(true);
        info!(device_id = %self.device_id, "Tunnel closed: {}", reason);
    }

    async fn read_loop<S>(
        inner: Arc<Self>,
        mut framed: FramedRead<ReadHalf<S>, FrameCodec<TunnelFrame>>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut closed_rx = inner.closed_tx.subscribe();
        loop {
            tokio::select! {
                item = framed.next() => {
                    match item {
                        Some(Ok(frame)) => inner.handle_frame(frame).await,
                        Some(Err(e)) => {
                            debug!(device_id = %inner.device_id, "Tunnel read failed: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = closed_rx.changed() => break,
            }
        }
        // Dropping the read half here and the write half in the write loop
        // releases the transport.
        inner.close_all("transport closed");
    }

    async fn write_loop<S>(
        inner: Arc<Self>,
        mut sink: FramedWrite<WriteHalf<S>, FrameCodec<TunnelFrame>>,
        mut frames_rx: mpsc::Receiver<TunnelFrame>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut closed_rx = inner.closed_tx.subscribe();
        loop {
            tokio::select! {
                frame = frames_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                debug!(device_id = %inner.device_id, "Tunnel write failed: {}", e);
                                inner.close_all("transport write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = closed_rx.changed() => break,
            }
        }
    }

    async fn keepalive_loop(inner: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut closed_rx = inner.closed_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let idle = Utc::now().timestamp_millis()
                        - inner.last_seen.load(Ordering::Relaxed);
                    if idle > 2 * (interval.as_millis() as i64) {
                        warn!(
                            device_id = %inner.device_id,
                            idle_ms = idle,
                            "Keepalive deadline missed"
                        );
                        inner.close_all("keepalive deadline missed");
                        break;
                    }
                    if inner.frames_tx.send(TunnelFrame::Keepalive).await.is_err() {
                        break;
                    }
                }
                _ = closed_rx.changed() => break,
            }
        }
    }

    fn spawn_channel_egress(inner: Arc<Self>, channel_id: u32, mut out_rx: mpsc::Receiver<Bytes>) {
        let frames_tx = inner.frames_tx.clone();
        let mut closed_rx = inner.closed_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = out_rx.recv() => {
                        match chunk {
                            Some(data) => {
                                let frame = TunnelFrame::Data {
                                    channel_id,
                                    payload: data.to_vec(),
                                };
                                if frames_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                // Caller dropped its channel handle. The close
                                // must not fall victim to a full frame queue,
                                // so wait for a slot like the data path does.
                                if inner.remove_channel(channel_id) {
                                    let _ = frames_tx
                                        .send(TunnelFrame::CloseChannel { channel_id })
                                        .await;
                                }
                                break;
                            }
                        }
                    }
                    _ = closed_rx.changed() => break,
                }
            }
        });
    }

    async fn handle_frame(&self, frame: TunnelFrame) {
        self.touch();
        match frame {
            TunnelFrame::OpenConfirm { channel_id } => {
                let waiter = self.pending.lock().unwrap().remove(&channel_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(Ok(()));
                }
            }
            TunnelFrame::OpenFailure { channel_id, reason } => {
                let waiter = self.pending.lock().unwrap().remove(&channel_id);
                self.remove_channel(channel_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(Err(reason));
                }
            }
            TunnelFrame::Data {
                channel_id,
                payload,
            } => {
                let tx = self.channels.lock().unwrap().get(&channel_id).cloned();
                match tx {
                    Some(tx) => {
                        if tx.send(Bytes::from(payload)).await.is_err()
                            && self.remove_channel(channel_id)
                        {
                            let _ = self
                                .frames_tx
                                .try_send(TunnelFrame::CloseChannel { channel_id });
                        }
                    }
                    None => {
                        trace!(channel_id, "Dropping payload for unknown channel");
                    }
                }
            }
            TunnelFrame::CloseChannel { channel_id } => {
                self.remove_channel(channel_id);
            }
            TunnelFrame::Keepalive => {
                let _ = self.frames_tx.try_send(TunnelFrame::KeepaliveAck);
            }
            TunnelFrame::KeepaliveAck => {}
            TunnelFrame::OpenChannel { channel_id, .. } => {
                // Channel opens only flow broker-to-device.
                let _ = self.frames_tx.try_send(TunnelFrame::OpenFailure {
                    channel_id,
                    reason: RejectReason::PortRefused,
                });
            }
            TunnelFrame::Hello { .. } | TunnelFrame::HelloAck { .. } => {
                debug!(device_id = %self.device_id, "Unexpected handshake frame mid-stream");
            }
        }
    }
}
