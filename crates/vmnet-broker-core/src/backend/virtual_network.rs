//! In-process virtual network backend.
//!
//! Allocates IPv4 /24 subnets from `192.168.64.0` upward (or claims the
//! configured subnet), a random IPv6 ULA /64 prefix, and an instance id.
//! Subnets return to the pool when the instance is destroyed.

use super::{BackendError, NetworkBackend, NetworkInstance};
use crate::config::NetworkConfig;
use chrono::Utc;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

const POOL_FIRST_OCTET: u8 = 64;
const DYNAMIC_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
const IPV6_PREFIX_LEN: u8 = 64;

#[derive(Debug, Clone, Copy)]
struct Allocation {
    subnet: Ipv4Addr,
    mask: Ipv4Addr,
}

impl Allocation {
    fn overlaps(&self, subnet: Ipv4Addr, mask: Ipv4Addr) -> bool {
        // Compare under the wider of the two masks.
        let common = u32::from(self.mask) & u32::from(mask);
        u32::from(self.subnet) & common == u32::from(subnet) & common
    }
}

/// Backend that allocates address space for virtual networks.
#[derive(Debug, Default)]
pub struct VirtualNetworkBackend {
    allocations: Mutex<HashMap<Uuid, Allocation>>,
}

impl VirtualNetworkBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of networks currently instantiated.
    pub fn active_networks(&self) -> usize {
        self.allocations.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn lock_allocations(
        &self,
    ) -> std::result::Result<MutexGuard<'_, HashMap<Uuid, Allocation>>, BackendError> {
        self.allocations
            .lock()
            .map_err(|_| BackendError::Other("allocation table lock poisoned".to_string()))
    }

    fn claim(
        allocations: &HashMap<Uuid, Allocation>,
        config: &NetworkConfig,
    ) -> std::result::Result<Allocation, BackendError> {
        match (config.subnet, config.mask) {
            (Some(subnet), Some(mask)) => {
                let mask_bits = u32::from(mask);
                if mask_bits.leading_ones() + mask_bits.trailing_zeros() != 32 {
                    return Err(BackendError::InvalidConfig {
                        message: format!("mask {} is not contiguous", mask),
                    });
                }
                if u32::from(subnet) & !mask_bits != 0 {
                    return Err(BackendError::InvalidConfig {
                        message: format!("{} is not a network address for mask {}", subnet, mask),
                    });
                }
                if allocations.values().any(|a| a.overlaps(subnet, mask)) {
                    return Err(BackendError::SubnetConflict { subnet, mask });
                }
                Ok(Allocation { subnet, mask })
            }
            (None, None) => (POOL_FIRST_OCTET..=u8::MAX)
                .map(|octet| Ipv4Addr::new(192, 168, octet, 0))
                .find(|candidate| {
                    !allocations
                        .values()
                        .any(|a| a.overlaps(*candidate, DYNAMIC_MASK))
                })
                .map(|subnet| Allocation {
                    subnet,
                    mask: DYNAMIC_MASK,
                })
                .ok_or(BackendError::SubnetExhausted),
            _ => Err(BackendError::InvalidConfig {
                message: "subnet and mask must be set together".to_string(),
            }),
        }
    }
}

/// Random unique local /64 prefix (fd00::/8 plus a 40-bit global id).
fn random_ula_prefix() -> Ipv6Addr {
    let global_id: [u8; 5] = rand::random();
    let mut octets = [0u8; 16];
    octets[0] = 0xfd;
    octets[1..6].copy_from_slice(&global_id);
    Ipv6Addr::from(octets)
}

#[async_trait::async_trait]
impl NetworkBackend for VirtualNetworkBackend {
    async fn create(
        &self,
        config: &NetworkConfig,
    ) -> std::result::Result<NetworkInstance, BackendError> {
        let mut allocations = self.lock_allocations()?;
        let allocation = Self::claim(&allocations, config)?;

        let instance = NetworkInstance {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            mode: config.mode,
            subnet: allocation.subnet,
            mask: allocation.mask,
            ipv6_prefix: random_ula_prefix(),
            prefix_len: IPV6_PREFIX_LEN,
            created_at: Utc::now(),
        };
        allocations.insert(instance.id, allocation);

        info!(
            "created network '{}' subnet '{}' mask '{}' ipv6_prefix '{}' prefix_len {}",
            instance.name, instance.subnet, instance.mask, instance.ipv6_prefix, instance.prefix_len
        );
        Ok(instance)
    }

    async fn destroy(&self, instance: NetworkInstance) -> std::result::Result<(), BackendError> {
        let mut allocations = self.lock_allocations()?;
        if allocations.remove(&instance.id).is_none() {
            return Err(BackendError::UnknownInstance { id: instance.id });
        }

        info!(
            "deleted network '{}' subnet '{}' mask '{}' ipv6_prefix '{}' prefix_len {}",
            instance.name, instance.subnet, instance.mask, instance.ipv6_prefix, instance.prefix_len
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkMode;

    #[tokio::test]
    async fn test_dynamic_subnets_do_not_collide() {
        let backend = VirtualNetworkBackend::new();
        let config = NetworkConfig::new("shared", NetworkMode::Shared);

        let first = backend.create(&config).await.unwrap();
        let second = backend.create(&config).await.unwrap();

        assert_eq!(first.subnet, Ipv4Addr::new(192, 168, 64, 0));
        assert_eq!(second.subnet, Ipv4Addr::new(192, 168, 65, 0));
        assert_ne!(first.id, second.id);
        assert_eq!(backend.active_networks(), 2);
    }

    #[tokio::test]
    async fn test_destroy_returns_subnet_to_pool() {
        let backend = VirtualNetworkBackend::new();
        let config = NetworkConfig::new("host", NetworkMode::Host);

        let first = backend.create(&config).await.unwrap();
        let subnet = first.subnet;
        backend.destroy(first).await.unwrap();
        assert_eq!(backend.active_networks(), 0);

        let again = backend.create(&config).await.unwrap();
        assert_eq!(again.subnet, subnet);
    }

    #[tokio::test]
    async fn test_destroy_unknown_instance_fails() {
        let backend = VirtualNetworkBackend::new();
        let config = NetworkConfig::new("shared", NetworkMode::Shared);

        let instance = backend.create(&config).await.unwrap();
        backend.destroy(instance.clone()).await.unwrap();

        assert_eq!(
            backend.destroy(instance.clone()).await,
            Err(BackendError::UnknownInstance { id: instance.id })
        );
    }

    #[tokio::test]
    async fn test_configured_subnet_conflict() {
        let backend = VirtualNetworkBackend::new();
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        let lab = NetworkConfig::new("lab", NetworkMode::Host)
            .with_subnet(Ipv4Addr::new(192, 168, 64, 0), mask);

        // Dynamic allocation takes 192.168.64.0/24 first.
        backend
            .create(&NetworkConfig::new("shared", NetworkMode::Shared))
            .await
            .unwrap();

        assert!(matches!(
            backend.create(&lab).await,
            Err(BackendError::SubnetConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_configured_subnet_must_be_network_address() {
        let backend = VirtualNetworkBackend::new();
        let config = NetworkConfig::new("lab", NetworkMode::Host).with_subnet(
            Ipv4Addr::new(192, 168, 105, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        );

        assert!(matches!(
            backend.create(&config).await,
            Err(BackendError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_ula_prefix_shape() {
        let prefix = random_ula_prefix();
        let octets = prefix.octets();
        assert_eq!(octets[0], 0xfd);
        assert!(octets[6..].iter().all(|b| *b == 0));
    }
}
