//! The broker: one event loop owning every session and every network.
//!
//! The listener, the connection tasks and the backend tasks never touch
//! broker state. They post [`BrokerEvent`]s and [`ResourceEvent`]s, and
//! [`Broker::run`] applies them one at a time, so the session table and the
//! resource table need no locks.

use crate::backend::NetworkBackend;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::ipc::Listener;
use crate::resource::{ResourceEvent, ResourceManager};
use crate::router::{Reply, Request, RequestId, Routed, Router};
use crate::session::{Peer, Session, SessionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Identifies a queued acquire: who asked, and which request to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub session: SessionId,
    pub request: RequestId,
}

/// Input to the broker loop.
pub enum BrokerEvent {
    Connected {
        id: SessionId,
        peer: Box<dyn Peer>,
    },
    Request {
        id: SessionId,
        request_id: RequestId,
        request: Request,
    },
    /// The connection ended, cleanly or not. May be reported more than once.
    Disconnected { id: SessionId },
    /// The listener can no longer accept connections.
    ListenerFailed { error: BrokerError },
}

impl fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerEvent::Connected { id, peer } => f
                .debug_struct("Connected")
                .field("id", id)
                .field("peer", &peer.info())
                .finish(),
            BrokerEvent::Request {
                id,
                request_id,
                request,
            } => f
                .debug_struct("Request")
                .field("id", id)
                .field("request_id", request_id)
                .field("request", request)
                .finish(),
            BrokerEvent::Disconnected { id } => {
                f.debug_struct("Disconnected").field("id", id).finish()
            }
            BrokerEvent::ListenerFailed { error } => f
                .debug_struct("ListenerFailed")
                .field("error", error)
                .finish(),
        }
    }
}

/// Why [`Broker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No client connected for the idle timeout.
    Idle,
    /// SIGINT or SIGTERM with no client connected.
    Signal,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Idle => f.write_str("idle timeout"),
            ShutdownReason::Signal => f.write_str("signal"),
        }
    }
}

pub struct Broker {
    resources: ResourceManager<Ticket>,
    resource_events: mpsc::UnboundedReceiver<ResourceEvent>,
    sessions: HashMap<SessionId, Session>,
    router: Router,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
}

impl Broker {
    pub fn new(config: &BrokerConfig, backend: Arc<dyn NetworkBackend>) -> Self {
        let (resources, resource_events) = ResourceManager::new(
            config.networks.iter().cloned(),
            backend,
            config.create_timeout(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            resources,
            resource_events,
            sessions: HashMap::new(),
            router: Router::new(config.allowed_uids.clone()),
            events_tx,
            events_rx,
            idle_timeout: config.idle_timeout(),
            idle_deadline: None,
        }
    }

    /// Sender for posting events into the loop.
    pub fn events(&self) -> mpsc::UnboundedSender<BrokerEvent> {
        self.events_tx.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn resources(&self) -> &ResourceManager<Ticket> {
        &self.resources
    }

    /// Apply one event. Only a listener failure is an error.
    pub fn handle_event(&mut self, event: BrokerEvent) -> Result<()> {
        match event {
            BrokerEvent::Connected { id, peer } => self.on_connected(id, peer),
            BrokerEvent::Request {
                id,
                request_id,
                request,
            } => self.on_request(id, request_id, request),
            BrokerEvent::Disconnected { id } => self.on_disconnected(id),
            BrokerEvent::ListenerFailed { error } => {
                error!("[main] listener failed: {}", error);
                return Err(error);
            }
        }
        Ok(())
    }

    /// Apply a backend completion and answer the acquires it resolves.
    pub fn handle_resource_event(&mut self, event: ResourceEvent) {
        for resolution in self.resources.handle_event(event) {
            let ticket = resolution.waiter;
            let Some(session) = self.sessions.get_mut(&ticket.session) else {
                // Waiters are cancelled on disconnect, so this is a stray.
                warn!(
                    "[main] resolution for unknown session {} on '{}'",
                    ticket.session, resolution.name
                );
                if resolution.result.is_ok() {
                    self.resources.release(&resolution.name);
                }
                continue;
            };

            let reply = self.router.resolve(
                &resolution.name,
                resolution.result,
                session,
                &mut self.resources,
            );
            Self::send(session, ticket.request, reply);
        }
    }

    fn send(session: &Session, request: RequestId, reply: Reply) {
        if let Err(e) = session.send_reply(request, reply) {
            // The disconnect event is on its way and releases the lease.
            debug!("[{}] reply dropped: {}", session.label(), e);
        }
    }

    fn on_connected(&mut self, id: SessionId, peer: Box<dyn Peer>) {
        let mut session = Session::new(id, peer);
        session.mark_connected();
        info!("[{}] connected (session {})", session.label(), id);

        if self.idle_deadline.take().is_some() {
            debug!("[main] idle timer cancelled");
        }
        self.sessions.insert(id, session);
    }

    fn on_request(&mut self, id: SessionId, request_id: RequestId, request: Request) {
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!("[main] request from unknown session {}", id);
            return;
        };
        if !session.is_connected() {
            return;
        }

        let ticket = Ticket {
            session: id,
            request: request_id,
        };
        match self
            .router
            .handle(&request, ticket, session, &mut self.resources)
        {
            Routed::Reply(reply) => Self::send(session, request_id, reply),
            Routed::Deferred => {}
        }
    }

    fn on_disconnected(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.remove(&id) else {
            debug!("[main] session {} already disconnected", id);
            return;
        };

        let held = session.disconnect();
        let cancelled = self.resources.cancel_waiters(|ticket| ticket.session == id);
        if cancelled > 0 {
            debug!(
                "[{}] cancelled {} pending acquires",
                session.label(),
                cancelled
            );
        }
        self.resources.release_all(&held);
        info!(
            "[{}] disconnected, released {} networks",
            session.label(),
            held.len()
        );

        if self.sessions.is_empty() {
            if let Some(timeout) = self.idle_timeout {
                debug!("[main] no clients left, idle shutdown in {:?}", timeout);
                self.idle_deadline = Some(Instant::now() + timeout);
            }
        }
    }

    /// Destroy every active network.
    ///
    /// Queued acquires are dropped, and outstanding backend calls are given
    /// up to the create timeout each to land first.
    pub async fn shutdown_networks(&mut self) {
        info!("[main] shutting down networks");
        self.resources.cancel_waiters(|_| true);

        let limit = self.resources.create_timeout();
        while self.resources.in_flight() > 0 {
            match tokio::time::timeout(limit, self.resource_events.recv()).await {
                Ok(Some(event)) => self.handle_resource_event(event),
                _ => break,
            }
        }

        self.resources.shutdown().await;
    }

    /// Run until idle, a termination signal with no clients, or a listener
    /// failure. Networks are shut down before returning.
    pub async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<&'static str>,
    ) -> Result<ShutdownReason> {
        let reason = loop {
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.handle_event(event) {
                        self.shutdown_networks().await;
                        return Err(e);
                    }
                }
                Some(event) = self.resource_events.recv() => {
                    self.handle_resource_event(event);
                }
                Some(signal) = signals.recv() => {
                    if self.sessions.is_empty() {
                        info!("[main] received {}, shutting down", signal);
                        break ShutdownReason::Signal;
                    }
                    warn!(
                        "[main] ignoring {}: {} clients connected",
                        signal,
                        self.sessions.len()
                    );
                }
                _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)),
                    if idle_deadline.is_some() =>
                {
                    info!("[main] idle timeout, shutting down");
                    break ShutdownReason::Idle;
                }
            }
        };

        self.shutdown_networks().await;
        Ok(reason)
    }

    /// Accept connections on `listener` and run the loop.
    ///
    /// The socket file is removed when this returns.
    pub async fn serve(
        self,
        listener: Listener,
        signals: mpsc::UnboundedReceiver<&'static str>,
    ) -> Result<ShutdownReason> {
        let _handle = listener.start(self.events());
        self.run(signals).await
    }
}

/// Forward SIGINT and SIGTERM into a channel for [`Broker::run`].
pub fn termination_signals() -> Result<mpsc::UnboundedReceiver<&'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                else => break,
            };
            if tx.send(name).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}
