//! Inter-instance channel forwarding
//!
//! When a lookup lands on an instance that does not terminate the
//! device's tunnel, the channel is brokered over a plain TCP hop to the
//! owning instance: the [`ForwardServer`] answers for tunnels in the
//! local registry, and [`TcpForwarder`] is the client side the routing
//! layer plugs in as its [`cira_routing::ChannelForwarder`].
//!
//! One forward connection carries one request: a probe, or a single
//! channel's lifetime.

pub mod client;
pub mod server;

pub use client::TcpForwarder;
pub use server::ForwardServer;
