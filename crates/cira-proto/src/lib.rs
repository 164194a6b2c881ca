//! Wire protocol for the CIRA broker
//!
//! Two sockets speak this protocol: the device tunnel (a managed device's
//! persistent connection to the instance that terminates it) and the
//! inter-instance forward link (one instance opening a channel on a tunnel
//! another instance holds). Both carry length-prefixed bincode frames; the
//! frame sets differ per socket and live in [`frames`].

pub mod codec;
pub mod frames;
pub mod ids;

pub use codec::{read_frame, write_frame, CodecError, FrameCodec};
pub use frames::{ForwardMessage, RejectReason, TunnelFrame};
pub use ids::{DeviceId, DeviceIdError};

/// Protocol version carried in the tunnel hello frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size (4MB)
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Queue depth for per-channel byte buffers.
pub const CHANNEL_BUFFER: usize = 64;
