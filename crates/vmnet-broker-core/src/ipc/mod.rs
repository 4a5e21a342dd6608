//! Local IPC between clients and the broker.
//!
//! Length-prefixed JSON-RPC 2.0 over a Unix domain socket.
//!
//! # Architecture
//!
//! - **Listener**: owns the service socket, turns connections into broker events
//! - **Client**: connects to the broker and acquires networks
//! - **Protocol**: framing and JSON-RPC types shared by both

pub mod client;
pub mod listener;
pub mod protocol;

pub use client::{acquire_network, acquire_network_at, BrokerClient};
pub use listener::{ConnectionPeer, Listener, ListenerHandle};
pub use protocol::{IpcRequest, IpcResponse};
