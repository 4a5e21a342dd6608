//! vmnet-broker - shared virtual networks for independent processes.
//!
//! The broker vends named virtual networks to client processes over a local
//! Unix socket. The first acquire of a name creates the network; later
//! acquires attach to the same instance. A lease is held for exactly as long
//! as the client stays connected, and the network is destroyed when its last
//! holder goes away.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmnet_broker::BrokerClient;
//!
//! #[tokio::main]
//! async fn main() -> vmnet_broker::Result<()> {
//!     let client = BrokerClient::connect_default().await?;
//!
//!     // Valid until `client` is dropped
//!     let network = client.acquire_network("shared").await?.network()?;
//!     println!("subnet {}/{}", network.subnet, network.mask);
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod broker;
pub mod config;
pub mod error;
pub mod ipc;
pub mod resource;
pub mod router;
pub mod session;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use backend::{
    BackendError, NetworkBackend, NetworkInstance, NetworkSerialization, VirtualNetworkBackend,
};
pub use broker::{termination_signals, Broker, BrokerEvent, ShutdownReason};
pub use config::{BrokerConfig, BrokerLimits, NetworkConfig, NetworkMode};
pub use error::{BrokerError, ErrorKind, Result, StatusCode};
pub use ipc::{acquire_network, acquire_network_at, BrokerClient, Listener, ListenerHandle};
pub use resource::{ResourceManager, ResourceState};
pub use session::{Peer, PeerInfo, SessionId};
