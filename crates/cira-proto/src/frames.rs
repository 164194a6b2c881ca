//! Frame types for the tunnel and forward sockets

use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;

/// Frames exchanged on a device tunnel socket.
///
/// The device sends `Hello` once, then the broker drives channel opens and
/// both sides interleave `Data` frames for whatever channels are open.
/// Channel ids are allocated by the broker and never reused within one
/// tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TunnelFrame {
    /// First frame from the device: identify and optionally authenticate.
    Hello {
        version: u32,
        device_id: DeviceId,
        auth_token: Option<String>,
    },
    /// Broker accepted the tunnel.
    HelloAck {
        instance_id: String,
    },
    /// Broker asks the device to open a channel to one of its local ports.
    OpenChannel {
        channel_id: u32,
        port: u16,
    },
    /// Device accepted the channel; `Data` frames may now flow.
    OpenConfirm {
        channel_id: u32,
    },
    /// Device turned the channel down.
    OpenFailure {
        channel_id: u32,
        reason: RejectReason,
    },
    /// Channel payload, either direction. Payload for a channel id that is
    /// no longer open is discarded by the receiver.
    Data {
        channel_id: u32,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Either side is done with the channel.
    CloseChannel {
        channel_id: u32,
    },
    /// Liveness probe, either direction.
    Keepalive,
    /// Answer to a keepalive.
    KeepaliveAck,
}

/// Frames exchanged on an inter-instance forward socket.
///
/// One socket carries exactly one request: either a probe, or an open
/// handshake followed by that channel's byte stream. Closing the socket
/// closes the channel on both sides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ForwardMessage {
    /// Ask the owning instance whether it currently holds a device's tunnel.
    Probe {
        device_id: DeviceId,
    },
    /// Probe answer.
    ProbeResult {
        attached: bool,
    },
    /// Open a logical channel on a tunnel the receiving instance holds.
    OpenRequest {
        device_id: DeviceId,
        port: u16,
    },
    /// Channel is open; `Data` frames may flow.
    OpenAccepted,
    /// Channel could not be opened.
    OpenRejected {
        reason: RejectReason,
    },
    /// Channel payload, either direction.
    Data {
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Orderly channel shutdown.
    Close,
}

/// Why a channel open was turned down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectReason {
    /// The answering instance has no live tunnel for the device.
    UnknownDevice,
    /// The device declined the requested logical port.
    PortRefused,
    /// The tunnel exists but is shutting down.
    TunnelClosing,
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
