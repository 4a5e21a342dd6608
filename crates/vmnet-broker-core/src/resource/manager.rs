//! Create-or-attach with reference counting.
//!
//! The manager is driven from the broker's single event loop and never
//! blocks it: backend calls run in spawned tasks that report back through a
//! [`ResourceEvent`] channel, which the loop feeds into
//! [`ResourceManager::handle_event`].
//!
//! Per network the state machine is:
//!
//! ```text
//! Uninitialized --acquire--> Pending --created--> Active --last release--> Destroying
//!       ^                       |                                              |
//!       +-------create failed---+                                              |
//!       +----------------------------------destroyed---------------------------+
//! ```
//!
//! Acquirers arriving while a network is `Pending` or `Destroying` are queued
//! on the network's waiter list and resolved together when the in-flight
//! backend call completes, so a burst of first-touch acquires results in a
//! single `create`.

use crate::backend::{BackendError, NetworkBackend, NetworkInstance, NetworkSerialization};
use crate::config::NetworkConfig;
use crate::error::BrokerError;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a named network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Uninitialized,
    /// Creation in flight.
    Pending,
    Active,
    /// Destruction in flight; no new leases until it completes.
    Destroying,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResourceState::Uninitialized => "uninitialized",
            ResourceState::Pending => "pending",
            ResourceState::Active => "active",
            ResourceState::Destroying => "destroying",
        };
        f.write_str(text)
    }
}

/// Completion of a backend call, delivered back to the event loop.
#[derive(Debug)]
pub enum ResourceEvent {
    Created {
        name: String,
        result: std::result::Result<NetworkInstance, BackendError>,
    },
    CreateTimedOut {
        name: String,
        after: Duration,
    },
    Destroyed {
        name: String,
        result: std::result::Result<(), BackendError>,
    },
}

/// Immediate outcome of [`ResourceManager::acquire`].
#[derive(Debug)]
pub enum Acquire {
    /// The network is active; the lease is counted.
    Granted(NetworkSerialization),
    /// The caller was queued and will appear in a later [`Resolution`].
    Queued,
    Failed(BrokerError),
}

/// Outcome for one queued acquirer.
///
/// On success the lease is already counted in the network's refcount.
#[derive(Debug)]
pub struct Resolution<W> {
    pub waiter: W,
    pub name: String,
    pub result: std::result::Result<NetworkSerialization, BrokerError>,
}

struct Resource<W> {
    config: NetworkConfig,
    state: ResourceState,
    refcount: usize,
    instance: Option<NetworkInstance>,
    serialization: Option<NetworkSerialization>,
    waiters: VecDeque<W>,
}

impl<W> Resource<W> {
    fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            state: ResourceState::Uninitialized,
            refcount: 0,
            instance: None,
            serialization: None,
            waiters: VecDeque::new(),
        }
    }
}

/// Owns every configured network, its instance and its lease count.
pub struct ResourceManager<W> {
    resources: HashMap<String, Resource<W>>,
    backend: Arc<dyn NetworkBackend>,
    create_timeout: Duration,
    events: mpsc::UnboundedSender<ResourceEvent>,
}

impl<W> ResourceManager<W> {
    /// Create a manager for the given catalog.
    ///
    /// Returns the receiving end of the completion channel; the owner must
    /// feed every event it yields into [`handle_event`](Self::handle_event).
    pub fn new(
        networks: impl IntoIterator<Item = NetworkConfig>,
        backend: Arc<dyn NetworkBackend>,
        create_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ResourceEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let resources = networks
            .into_iter()
            .map(|config| (config.name.clone(), Resource::new(config)))
            .collect();

        let manager = Self {
            resources,
            backend,
            create_timeout,
            events,
        };
        (manager, events_rx)
    }

    pub fn state(&self, name: &str) -> Option<ResourceState> {
        self.resources.get(name).map(|r| r.state)
    }

    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.resources.get(name).map(|r| r.refcount)
    }

    /// Serialization of an active network.
    pub fn serialization(&self, name: &str) -> Option<&NetworkSerialization> {
        self.resources
            .get(name)
            .filter(|r| r.state == ResourceState::Active)
            .and_then(|r| r.serialization.as_ref())
    }

    pub fn waiting(&self, name: &str) -> usize {
        self.resources.get(name).map(|r| r.waiters.len()).unwrap_or(0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Number of networks with a backend call outstanding.
    pub fn in_flight(&self) -> usize {
        self.resources
            .values()
            .filter(|r| matches!(r.state, ResourceState::Pending | ResourceState::Destroying))
            .count()
    }

    pub fn create_timeout(&self) -> Duration {
        self.create_timeout
    }

    /// Acquire a lease on `name`, creating the network if needed.
    pub fn acquire(&mut self, name: &str, waiter: W) -> Acquire {
        let Some(resource) = self.resources.get_mut(name) else {
            return Acquire::Failed(BrokerError::NotFound {
                network: name.to_string(),
            });
        };

        match resource.state {
            ResourceState::Active => match &resource.serialization {
                Some(serialization) => {
                    resource.refcount += 1;
                    debug!(
                        "network '{}' attached (refcount {})",
                        name, resource.refcount
                    );
                    Acquire::Granted(serialization.clone())
                }
                None => {
                    error!("network '{}' is active without an instance", name);
                    Acquire::Failed(BrokerError::internal(format!(
                        "network '{}' is active without an instance",
                        name
                    )))
                }
            },
            ResourceState::Uninitialized => {
                resource.state = ResourceState::Pending;
                resource.waiters.push_back(waiter);
                let config = resource.config.clone();
                self.spawn_create(config);
                Acquire::Queued
            }
            ResourceState::Pending => {
                resource.waiters.push_back(waiter);
                debug!(
                    "network '{}' creation in flight, coalescing ({} waiting)",
                    name,
                    resource.waiters.len()
                );
                Acquire::Queued
            }
            ResourceState::Destroying => {
                resource.waiters.push_back(waiter);
                debug!(
                    "network '{}' is being destroyed, parking acquire ({} waiting)",
                    name,
                    resource.waiters.len()
                );
                Acquire::Queued
            }
        }
    }

    /// Drop one lease on `name`, destroying the network with the last one.
    pub fn release(&mut self, name: &str) {
        let Some(resource) = self.resources.get_mut(name) else {
            warn!("release of unknown network '{}'", name);
            return;
        };

        if resource.state != ResourceState::Active || resource.refcount == 0 {
            error!(
                "unbalanced release of network '{}' (state {}, refcount {})",
                name, resource.state, resource.refcount
            );
            return;
        }

        resource.refcount -= 1;
        debug!("network '{}' released (refcount {})", name, resource.refcount);

        if resource.refcount == 0 {
            resource.serialization = None;
            match resource.instance.take() {
                Some(instance) => {
                    resource.state = ResourceState::Destroying;
                    self.spawn_destroy(instance);
                }
                None => resource.state = ResourceState::Uninitialized,
            }
        }
    }

    /// Release one lease per name. Distinct networks are independent, so
    /// order does not matter.
    pub fn release_all<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.release(name.as_ref());
        }
    }

    /// Remove queued acquirers matching `predicate` from every network.
    ///
    /// Used when a session disconnects while its acquire is still queued.
    pub fn cancel_waiters(&mut self, mut predicate: impl FnMut(&W) -> bool) -> usize {
        let mut cancelled = 0;
        for resource in self.resources.values_mut() {
            let before = resource.waiters.len();
            resource.waiters.retain(|w| !predicate(w));
            cancelled += before - resource.waiters.len();
        }
        cancelled
    }

    /// Apply a backend completion and return the queued acquirers it resolves.
    pub fn handle_event(&mut self, event: ResourceEvent) -> Vec<Resolution<W>> {
        match event {
            ResourceEvent::Created { name, result } => self.on_created(name, result),
            ResourceEvent::CreateTimedOut { name, after } => {
                warn!("creating network '{}' timed out after {:?}", name, after);
                self.fail_pending(
                    name,
                    format!("backend did not respond within {:?}", after),
                )
            }
            ResourceEvent::Destroyed { name, result } => {
                self.on_destroyed(name, result);
                Vec::new()
            }
        }
    }

    fn on_created(
        &mut self,
        name: String,
        result: std::result::Result<NetworkInstance, BackendError>,
    ) -> Vec<Resolution<W>> {
        let instance = match result {
            Ok(instance) => instance,
            Err(e) => {
                warn!("failed to create network '{}': {}", name, e);
                return self.fail_pending(name, e.to_string());
            }
        };

        let Some(resource) = self.resources.get_mut(&name) else {
            error!("creation completed for unknown network '{}'", name);
            return Vec::new();
        };
        if resource.state != ResourceState::Pending {
            error!(
                "creation completed for network '{}' in state {}",
                name, resource.state
            );
            return Vec::new();
        }

        if resource.waiters.is_empty() {
            // Every acquirer disconnected while we were creating.
            info!("network '{}' created with no remaining holders", name);
            resource.state = ResourceState::Destroying;
            self.spawn_destroy(instance);
            return Vec::new();
        }

        let serialization = match instance.serialization() {
            Ok(serialization) => serialization,
            Err(e) => {
                error!("failed to serialize network '{}': {}", name, e);
                resource.state = ResourceState::Destroying;
                let message = e.to_string();
                let failed = resource
                    .waiters
                    .drain(..)
                    .map(|waiter| Resolution {
                        waiter,
                        name: name.clone(),
                        result: Err(BrokerError::internal(message.clone())),
                    })
                    .collect();
                self.spawn_destroy(instance);
                return failed;
            }
        };
        resource.state = ResourceState::Active;
        resource.refcount = resource.waiters.len();
        resource.instance = Some(instance);
        resource.serialization = Some(serialization.clone());

        info!(
            "network '{}' active (refcount {})",
            name, resource.refcount
        );

        resource
            .waiters
            .drain(..)
            .map(|waiter| Resolution {
                waiter,
                name: name.clone(),
                result: Ok(serialization.clone()),
            })
            .collect()
    }

    fn fail_pending(&mut self, name: String, message: String) -> Vec<Resolution<W>> {
        let Some(resource) = self.resources.get_mut(&name) else {
            error!("creation failed for unknown network '{}'", name);
            return Vec::new();
        };
        if resource.state != ResourceState::Pending {
            error!(
                "creation failed for network '{}' in state {}",
                name, resource.state
            );
            return Vec::new();
        }

        resource.state = ResourceState::Uninitialized;
        resource.refcount = 0;

        resource
            .waiters
            .drain(..)
            .map(|waiter| Resolution {
                waiter,
                name: name.clone(),
                result: Err(BrokerError::CreateFailure {
                    network: name.clone(),
                    message: message.clone(),
                }),
            })
            .collect()
    }

    fn on_destroyed(&mut self, name: String, result: std::result::Result<(), BackendError>) {
        if let Err(e) = result {
            // The network is gone from our point of view either way.
            warn!("failed to delete network '{}': {}", name, e);
        }

        let Some(resource) = self.resources.get_mut(&name) else {
            error!("destruction completed for unknown network '{}'", name);
            return;
        };
        if resource.state != ResourceState::Destroying {
            error!(
                "destruction completed for network '{}' in state {}",
                name, resource.state
            );
            return;
        }

        resource.state = ResourceState::Uninitialized;
        debug!("network '{}' destroyed", name);

        if !resource.waiters.is_empty() {
            debug!(
                "recreating network '{}' for {} parked acquirers",
                name,
                resource.waiters.len()
            );
            resource.state = ResourceState::Pending;
            let config = resource.config.clone();
            self.spawn_create(config);
        }
    }

    fn spawn_create(&self, config: NetworkConfig) {
        let backend = self.backend.clone();
        let events = self.events.clone();
        let timeout = self.create_timeout;

        debug!("creating network '{}'", config.name);
        tokio::spawn(async move {
            let name = config.name.clone();
            let event = match tokio::time::timeout(timeout, backend.create(&config)).await {
                Ok(result) => ResourceEvent::Created { name, result },
                Err(_) => ResourceEvent::CreateTimedOut {
                    name,
                    after: timeout,
                },
            };
            // The receiver only goes away when the broker is shutting down.
            let _ = events.send(event);
        });
    }

    fn spawn_destroy(&self, instance: NetworkInstance) {
        let backend = self.backend.clone();
        let events = self.events.clone();

        debug!("destroying network '{}'", instance.name);
        tokio::spawn(async move {
            let name = instance.name.clone();
            let result = backend.destroy(instance).await;
            let _ = events.send(ResourceEvent::Destroyed { name, result });
        });
    }

    /// Destroy every active network, awaiting the backend directly.
    ///
    /// Called once when the broker stops so networks are not orphaned.
    /// Queued acquirers are dropped.
    pub async fn shutdown(&mut self) {
        for (name, resource) in self.resources.iter_mut() {
            resource.waiters.clear();
            resource.serialization = None;
            resource.refcount = 0;

            match resource.state {
                ResourceState::Active => {
                    if let Some(instance) = resource.instance.take() {
                        debug!("shutdown network '{}'", name);
                        if let Err(e) = self.backend.destroy(instance).await {
                            warn!("failed to delete network '{}': {}", name, e);
                        }
                    }
                    resource.state = ResourceState::Uninitialized;
                }
                ResourceState::Pending | ResourceState::Destroying => {
                    warn!(
                        "network '{}' still {} at shutdown",
                        name, resource.state
                    );
                }
                ResourceState::Uninitialized => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkMode;
    use crate::error::ErrorKind;
    use crate::testing::ScriptedBackend;

    fn catalog() -> Vec<NetworkConfig> {
        vec![
            NetworkConfig::new("shared", NetworkMode::Shared),
            NetworkConfig::new("host", NetworkMode::Host),
        ]
    }

    fn manager(
        backend: &Arc<ScriptedBackend>,
    ) -> (ResourceManager<u32>, mpsc::UnboundedReceiver<ResourceEvent>) {
        ResourceManager::new(catalog(), backend.clone(), Duration::from_secs(5))
    }

    async fn next(
        manager: &mut ResourceManager<u32>,
        events: &mut mpsc::UnboundedReceiver<ResourceEvent>,
    ) -> Vec<Resolution<u32>> {
        let event = events.recv().await.expect("resource event");
        manager.handle_event(event)
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found_without_backend_call() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, _events) = manager(&backend);

        match manager.acquire("ghost", 1) {
            Acquire::Failed(e) => assert_eq!(e.kind(), ErrorKind::NotFound),
            other => panic!("Expected NotFound, got: {:?}", other),
        }
        assert_eq!(backend.creates(), 0);
    }

    #[tokio::test]
    async fn test_first_acquire_creates_and_activates() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, mut events) = manager(&backend);

        assert!(matches!(manager.acquire("shared", 1), Acquire::Queued));
        assert_eq!(manager.state("shared"), Some(ResourceState::Pending));
        assert_eq!(manager.refcount("shared"), Some(0));

        let resolved = next(&mut manager, &mut events).await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].waiter, 1);
        assert!(resolved[0].result.is_ok());
        assert_eq!(manager.state("shared"), Some(ResourceState::Active));
        assert_eq!(manager.refcount("shared"), Some(1));
        assert_eq!(backend.creates(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_touch_coalesces_into_one_create() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, mut events) = manager(&backend);

        for waiter in 1..=5 {
            assert!(matches!(manager.acquire("shared", waiter), Acquire::Queued));
        }
        assert_eq!(manager.waiting("shared"), 5);

        let resolved = next(&mut manager, &mut events).await;
        assert_eq!(resolved.len(), 5);
        assert_eq!(backend.creates(), 1);
        assert_eq!(manager.refcount("shared"), Some(5));

        let handles: Vec<_> = resolved
            .into_iter()
            .map(|r| r.result.unwrap())
            .collect();
        assert!(handles.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_active_acquire_attaches_without_backend_call() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, mut events) = manager(&backend);

        manager.acquire("shared", 1);
        let first = next(&mut manager, &mut events).await.remove(0).result.unwrap();

        match manager.acquire("shared", 2) {
            Acquire::Granted(handle) => assert_eq!(handle, first),
            other => panic!("Expected Granted, got: {:?}", other),
        }
        assert_eq!(manager.refcount("shared"), Some(2));
        assert_eq!(backend.creates(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_fails_all_waiters_and_allows_retry() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_creates(true);
        let (mut manager, mut events) = manager(&backend);

        manager.acquire("shared", 1);
        manager.acquire("shared", 2);
        let resolved = next(&mut manager, &mut events).await;

        assert_eq!(resolved.len(), 2);
        for resolution in &resolved {
            match &resolution.result {
                Err(e) => assert_eq!(e.kind(), ErrorKind::CreateFailure),
                Ok(_) => panic!("Expected CreateFailure"),
            }
        }
        assert_eq!(manager.state("shared"), Some(ResourceState::Uninitialized));
        assert_eq!(manager.refcount("shared"), Some(0));

        backend.fail_creates(false);
        assert!(matches!(manager.acquire("shared", 3), Acquire::Queued));
        let resolved = next(&mut manager, &mut events).await;
        assert!(resolved[0].result.is_ok());
        assert_eq!(backend.creates(), 2);
    }

    #[tokio::test]
    async fn test_last_release_destroys_once() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, mut events) = manager(&backend);

        manager.acquire("shared", 1);
        manager.acquire("shared", 2);
        next(&mut manager, &mut events).await;

        manager.release("shared");
        assert_eq!(manager.refcount("shared"), Some(1));
        assert_eq!(manager.state("shared"), Some(ResourceState::Active));

        manager.release("shared");
        assert_eq!(manager.state("shared"), Some(ResourceState::Destroying));
        next(&mut manager, &mut events).await;

        assert_eq!(manager.state("shared"), Some(ResourceState::Uninitialized));
        assert_eq!(backend.destroys(), 1);
    }

    #[tokio::test]
    async fn test_destroy_failure_still_returns_to_uninitialized() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_destroys(true);
        let (mut manager, mut events) = manager(&backend);

        manager.acquire("host", 1);
        next(&mut manager, &mut events).await;
        manager.release("host");
        next(&mut manager, &mut events).await;

        assert_eq!(manager.state("host"), Some(ResourceState::Uninitialized));

        manager.acquire("host", 2);
        let resolved = next(&mut manager, &mut events).await;
        assert!(resolved[0].result.is_ok());
        assert_eq!(backend.creates(), 2);
    }

    #[tokio::test]
    async fn test_acquire_while_destroying_recreates_after_destroy() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, mut events) = manager(&backend);

        manager.acquire("shared", 1);
        next(&mut manager, &mut events).await;
        manager.release("shared");
        assert_eq!(manager.state("shared"), Some(ResourceState::Destroying));

        assert!(matches!(manager.acquire("shared", 2), Acquire::Queued));
        assert_eq!(manager.refcount("shared"), Some(0));

        // Destroy completes and kicks off a fresh creation.
        assert!(next(&mut manager, &mut events).await.is_empty());
        assert_eq!(manager.state("shared"), Some(ResourceState::Pending));

        let resolved = next(&mut manager, &mut events).await;
        assert_eq!(resolved[0].waiter, 2);
        assert!(resolved[0].result.is_ok());
        assert_eq!(backend.creates(), 2);
        assert_eq!(backend.destroys(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiters_cause_immediate_destroy() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, mut events) = manager(&backend);

        manager.acquire("shared", 7);
        assert_eq!(manager.cancel_waiters(|w| *w == 7), 1);

        assert!(next(&mut manager, &mut events).await.is_empty());
        assert_eq!(manager.state("shared"), Some(ResourceState::Destroying));
        assert_eq!(manager.refcount("shared"), Some(0));

        next(&mut manager, &mut events).await;
        assert_eq!(manager.state("shared"), Some(ResourceState::Uninitialized));
        assert_eq!(backend.destroys(), 1);
    }

    #[tokio::test]
    async fn test_create_timeout_is_create_failure() {
        let backend = Arc::new(ScriptedBackend::held());
        let (mut manager, mut events) =
            ResourceManager::new(catalog(), backend.clone(), Duration::from_millis(20));

        manager.acquire("shared", 1);
        let resolved = next(&mut manager, &mut events).await;

        match &resolved[0].result {
            Err(e) => assert_eq!(e.kind(), ErrorKind::CreateFailure),
            Ok(_) => panic!("Expected CreateFailure"),
        }
        assert_eq!(manager.state("shared"), Some(ResourceState::Uninitialized));
    }

    #[tokio::test]
    async fn test_unbalanced_release_is_ignored() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, _events) = manager(&backend);

        manager.release("shared");
        manager.release("ghost");

        assert_eq!(manager.state("shared"), Some(ResourceState::Uninitialized));
        assert_eq!(backend.destroys(), 0);
    }

    #[tokio::test]
    async fn test_release_all_is_per_network() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, mut events) = manager(&backend);

        manager.acquire("shared", 1);
        next(&mut manager, &mut events).await;
        manager.acquire("host", 1);
        next(&mut manager, &mut events).await;
        manager.acquire("shared", 2);

        manager.release_all(["host", "shared"]);

        assert_eq!(manager.refcount("shared"), Some(1));
        assert_eq!(manager.state("host"), Some(ResourceState::Destroying));
    }

    #[tokio::test]
    async fn test_shutdown_destroys_active_networks() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut manager, mut events) = manager(&backend);

        manager.acquire("shared", 1);
        next(&mut manager, &mut events).await;

        manager.shutdown().await;

        assert_eq!(backend.destroys(), 1);
        assert_eq!(manager.state("shared"), Some(ResourceState::Uninitialized));
        assert!(manager.serialization("shared").is_none());
    }
}
