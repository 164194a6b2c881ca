//! Connection routing across broker instances
//!
//! The [`ConnectionLocator`] answers one question: given a device id,
//! where is its tunnel? On an instance that terminates tunnels the answer
//! comes straight from the local registry. On a routing instance it comes
//! from the ownership directory, materialized as a cached [`RemoteProxy`]
//! that brokers channels through a [`ChannelForwarder`].

pub mod cache;
pub mod forwarder;
pub mod locator;
pub mod proxy;

pub use cache::ProxyCache;
pub use forwarder::{ChannelForwarder, ForwardError};
pub use locator::{ConnectionLocator, ResolveError};
pub use proxy::RemoteProxy;
