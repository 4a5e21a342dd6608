//! Network backends.
//!
//! A backend instantiates and tears down the actual network behind a name.
//! The broker treats it as opaque: it calls `create` at most once per
//! creation cycle and `destroy` once the last lease is gone.

pub mod virtual_network;

pub use virtual_network::VirtualNetworkBackend;

use crate::config::{NetworkConfig, NetworkMode};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("No free subnet left in the allocation pool")]
    SubnetExhausted,

    #[error("Subnet {subnet}/{mask} overlaps a network in use")]
    SubnetConflict { subnet: Ipv4Addr, mask: Ipv4Addr },

    #[error("Invalid network configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown network instance {id}")]
    UnknownInstance { id: Uuid },

    #[error("Backend failure: {0}")]
    Other(String),
}

/// A live network owned by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInstance {
    pub id: Uuid,
    pub name: String,
    pub mode: NetworkMode,
    pub subnet: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub ipv6_prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub created_at: DateTime<Utc>,
}

impl NetworkInstance {
    /// Serialized form handed to clients.
    pub fn serialization(&self) -> Result<NetworkSerialization> {
        Ok(NetworkSerialization(serde_json::to_value(self)?))
    }
}

/// Opaque serialized network, as sent over the wire.
///
/// Clients get a copy; the live instance stays with the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkSerialization(serde_json::Value);

impl NetworkSerialization {
    pub fn from_value(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Decode the network description carried by this serialization.
    pub fn network(&self) -> Result<NetworkInstance> {
        serde_json::from_value(self.0.clone()).map_err(|e| BrokerError::InvalidReply {
            message: format!("malformed network serialization: {}", e),
        })
    }
}

/// Creates and destroys networks for the broker.
#[async_trait::async_trait]
pub trait NetworkBackend: Send + Sync + 'static {
    async fn create(
        &self,
        config: &NetworkConfig,
    ) -> std::result::Result<NetworkInstance, BackendError>;

    async fn destroy(&self, instance: NetworkInstance) -> std::result::Result<(), BackendError>;
}
