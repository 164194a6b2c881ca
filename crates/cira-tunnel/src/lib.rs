//! Device tunnel handling
//!
//! A [`DeviceTunnel`] wraps one device-initiated connection and multiplexes
//! logical channels over it. The [`TunnelRegistry`] tracks which tunnels an
//! instance currently terminates, and [`Connectable`] is the seam through
//! which callers open channels without caring whether the tunnel is local
//! or brokered through another instance.

pub mod channel;
pub mod registry;
pub mod tunnel;

pub use channel::{ChannelError, CiraChannel, Connectable};
pub use registry::{RegistryError, TunnelRegistry};
pub use tunnel::{DeviceTunnel, TunnelState};
