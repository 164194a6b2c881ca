//! Broker instance lifecycle
//!
//! A [`Broker`] is one instance of the relay. Its [`DeploymentMode`]
//! decides which halves it runs: accepting device tunnels, serving device
//! lookups, or both. Tunnel arrival and departure drive the ownership
//! directory and a local [`ConnectionEvent`] stream that downstream
//! consumers can subscribe to.

pub mod broker;
pub mod events;
pub mod mode;

pub use broker::{Broker, BrokerError};
pub use events::{ConnectionEvent, ConnectionStatus, EventKind};
pub use mode::{DeploymentMode, ParseModeError};
