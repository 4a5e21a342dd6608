//! Request validation and dispatch.
//!
//! The router works on encoding-independent [`Request`] and [`Reply`] values;
//! the IPC layer translates them to and from the wire.

use crate::backend::NetworkSerialization;
use crate::config::BrokerLimits;
use crate::error::{BrokerError, StatusCode};
use crate::resource::{Acquire, ResourceManager};
use crate::session::Session;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Per-connection request sequence number, used to pair replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Requested operation. Only `Acquire` exists today; anything else a newer
/// client sends is carried through and rejected as `InvalidRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Acquire,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub operation: Operation,
    pub network_name: Option<String>,
}

impl Request {
    pub fn acquire(name: impl Into<String>) -> Self {
        Self {
            operation: Operation::Acquire,
            network_name: Some(name.into()),
        }
    }
}

/// Reply to a request. `payload` is present iff `status` is success.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub payload: Option<NetworkSerialization>,
    pub message: Option<String>,
}

impl Reply {
    pub fn success(payload: NetworkSerialization) -> Self {
        Self {
            status: StatusCode::SUCCESS,
            payload: Some(payload),
            message: None,
        }
    }

    pub fn error(err: &BrokerError) -> Self {
        Self {
            status: err.status(),
            payload: None,
            message: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Result of routing a request.
#[derive(Debug)]
pub enum Routed {
    Reply(Reply),
    /// The acquire is queued behind an in-flight backend call; the reply is
    /// produced later by [`Router::resolve`].
    Deferred,
}

/// Validates requests and applies them to the resource manager.
#[derive(Debug, Clone, Default)]
pub struct Router {
    allowed_uids: Option<HashSet<u32>>,
}

impl Router {
    pub fn new(allowed_uids: Option<impl IntoIterator<Item = u32>>) -> Self {
        Self {
            allowed_uids: allowed_uids.map(|uids| uids.into_iter().collect()),
        }
    }

    /// Handle one request from `session`.
    ///
    /// On an immediate grant the session's held set is updated before the
    /// reply is returned, so a disconnect can never race ahead of the lease.
    pub fn handle<W>(
        &self,
        request: &Request,
        waiter: W,
        session: &mut Session,
        resources: &mut ResourceManager<W>,
    ) -> Routed {
        let name = match self.validate(request, session) {
            Ok(name) => name,
            Err(e) => {
                warn!("[{}] {}", session.label(), e);
                return Routed::Reply(Reply::error(&e));
            }
        };

        if session.holds(name) {
            // Already leased on this connection; leases do not stack.
            if let Some(serialization) = resources.serialization(name) {
                debug!("[{}] network '{}' already held", session.label(), name);
                return Routed::Reply(Reply::success(serialization.clone()));
            }
        }

        match resources.acquire(name, waiter) {
            Acquire::Granted(serialization) => {
                session.hold(name);
                info!("[{}] acquired network '{}'", session.label(), name);
                Routed::Reply(Reply::success(serialization))
            }
            Acquire::Queued => {
                debug!("[{}] waiting for network '{}'", session.label(), name);
                Routed::Deferred
            }
            Acquire::Failed(e) => {
                warn!("[{}] {}", session.label(), e);
                Routed::Reply(Reply::error(&e))
            }
        }
    }

    /// Build the reply for a queued acquire once the network resolved.
    ///
    /// A successful resolution has already been counted by the manager; if
    /// this session held the name before, the extra count is given back.
    pub fn resolve<W>(
        &self,
        name: &str,
        result: std::result::Result<NetworkSerialization, BrokerError>,
        session: &mut Session,
        resources: &mut ResourceManager<W>,
    ) -> Reply {
        match result {
            Ok(serialization) => {
                if session.hold(name) {
                    info!("[{}] acquired network '{}'", session.label(), name);
                } else {
                    resources.release(name);
                }
                Reply::success(serialization)
            }
            Err(e) => {
                warn!("[{}] {}", session.label(), e);
                Reply::error(&e)
            }
        }
    }

    fn validate<'r>(
        &self,
        request: &'r Request,
        session: &Session,
    ) -> Result<&'r str, BrokerError> {
        if let Operation::Unknown(op) = &request.operation {
            return Err(BrokerError::InvalidRequest {
                message: format!("unknown command '{}'", op),
            });
        }

        let name = request
            .network_name
            .as_deref()
            .ok_or_else(|| BrokerError::InvalidRequest {
                message: "missing network name".to_string(),
            })?;

        if name.is_empty()
            || name.len() > BrokerLimits::MAX_NETWORK_NAME_LEN
            || name.chars().any(char::is_control)
        {
            return Err(BrokerError::InvalidRequest {
                message: format!("invalid network name {:?}", name),
            });
        }

        if let Some(allowed) = &self.allowed_uids {
            let uid = session.info().uid;
            if !uid.is_some_and(|uid| allowed.contains(&uid)) {
                return Err(BrokerError::NotAllowed {
                    network: name.to_string(),
                    uid,
                });
            }
        }

        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, NetworkMode};
    use crate::session::SessionId;
    use crate::testing::{RecordingPeer, ScriptedBackend};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (
        Router,
        Session,
        ResourceManager<u32>,
        mpsc::UnboundedReceiver<crate::resource::ResourceEvent>,
        Arc<ScriptedBackend>,
    ) {
        let backend = Arc::new(ScriptedBackend::new());
        let (resources, events) = ResourceManager::new(
            vec![NetworkConfig::new("shared", NetworkMode::Shared)],
            backend.clone(),
            Duration::from_secs(5),
        );
        let mut session = Session::new(SessionId::new(1), Box::new(RecordingPeer::with_uid(501)));
        session.mark_connected();
        (Router::default(), session, resources, events, backend)
    }

    fn expect_reply(routed: Routed) -> Reply {
        match routed {
            Routed::Reply(reply) => reply,
            Routed::Deferred => panic!("Expected an immediate reply"),
        }
    }

    #[tokio::test]
    async fn test_unknown_operation_is_invalid_request() {
        let (router, mut session, mut resources, _events, backend) = setup();
        let request = Request {
            operation: Operation::Unknown("frobnicate".to_string()),
            network_name: Some("shared".to_string()),
        };

        let reply = expect_reply(router.handle(&request, 1, &mut session, &mut resources));
        assert_eq!(reply.status, StatusCode::INVALID_REQUEST);
        assert!(reply.payload.is_none());
        assert_eq!(backend.creates(), 0);
    }

    #[tokio::test]
    async fn test_empty_or_missing_name_is_invalid_request() {
        let (router, mut session, mut resources, _events, _backend) = setup();

        let reply = expect_reply(router.handle(
            &Request::acquire(""),
            1,
            &mut session,
            &mut resources,
        ));
        assert_eq!(reply.status, StatusCode::INVALID_REQUEST);

        let missing = Request {
            operation: Operation::Acquire,
            network_name: None,
        };
        let reply = expect_reply(router.handle(&missing, 2, &mut session, &mut resources));
        assert_eq!(reply.status, StatusCode::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_unconfigured_name_is_not_found_and_not_held() {
        let (router, mut session, mut resources, _events, backend) = setup();

        let reply = expect_reply(router.handle(
            &Request::acquire("ghost"),
            1,
            &mut session,
            &mut resources,
        ));
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert!(!session.holds("ghost"));
        assert_eq!(backend.creates(), 0);
    }

    #[tokio::test]
    async fn test_queued_acquire_resolves_into_lease() {
        let (router, mut session, mut resources, mut events, _backend) = setup();

        let routed = router.handle(&Request::acquire("shared"), 1, &mut session, &mut resources);
        assert!(matches!(routed, Routed::Deferred));
        assert!(!session.holds("shared"));

        let event = events.recv().await.unwrap();
        let resolution = resources.handle_event(event).remove(0);
        let reply = router.resolve(&resolution.name, resolution.result, &mut session, &mut resources);

        assert!(reply.is_success());
        assert!(session.holds("shared"));
        assert_eq!(resources.refcount("shared"), Some(1));
    }

    #[tokio::test]
    async fn test_repeated_acquire_does_not_stack_leases() {
        let (router, mut session, mut resources, mut events, _backend) = setup();

        router.handle(&Request::acquire("shared"), 1, &mut session, &mut resources);
        let event = events.recv().await.unwrap();
        let resolution = resources.handle_event(event).remove(0);
        router.resolve(&resolution.name, resolution.result, &mut session, &mut resources);

        let reply = expect_reply(router.handle(
            &Request::acquire("shared"),
            2,
            &mut session,
            &mut resources,
        ));
        assert!(reply.is_success());
        assert_eq!(resources.refcount("shared"), Some(1));
    }

    #[tokio::test]
    async fn test_uid_allow_list() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut resources, _events) = ResourceManager::new(
            vec![NetworkConfig::new("shared", NetworkMode::Shared)],
            backend.clone(),
            Duration::from_secs(5),
        );
        let router = Router::new(Some([0u32]));
        let mut session = Session::new(SessionId::new(1), Box::new(RecordingPeer::with_uid(501)));
        session.mark_connected();

        let reply = expect_reply(router.handle(
            &Request::acquire("shared"),
            1,
            &mut session,
            &mut resources,
        ));
        assert_eq!(reply.status, StatusCode::NOT_ALLOWED);
        assert_eq!(backend.creates(), 0);
    }
}
