//! Per-connection session state.
//!
//! A session is the lease holder: every network name in its held set counts
//! once toward that network's refcount, and all of them are released when
//! the connection goes away.

use crate::error::Result;
use crate::router::{Reply, RequestId};
use std::collections::HashSet;
use std::fmt;

/// Broker-assigned connection identity, unique for the broker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Credentials of the connected process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub pid: Option<u32>,
    pub uid: Option<u32>,
}

impl PeerInfo {
    /// Log label, `peer <pid>` when the pid is known.
    pub fn label(&self) -> String {
        match self.pid {
            Some(pid) => format!("peer {}", pid),
            None => "peer ?".to_string(),
        }
    }
}

/// What the broker needs from a connected client.
pub trait Peer: Send + 'static {
    fn info(&self) -> PeerInfo;

    /// Queue a reply for delivery. Fails if the connection is already gone.
    fn send_reply(&self, request: RequestId, reply: Reply) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
}

/// One connected client.
pub struct Session {
    id: SessionId,
    peer: Box<dyn Peer>,
    info: PeerInfo,
    label: String,
    state: SessionState,
    held: HashSet<String>,
}

impl Session {
    pub fn new(id: SessionId, peer: Box<dyn Peer>) -> Self {
        let info = peer.info();
        Self {
            id,
            label: info.label(),
            info,
            peer,
            state: SessionState::Connecting,
            held: HashSet::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn info(&self) -> PeerInfo {
        self.info
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mark_connected(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Record a lease. Returns `false` if the name was already held.
    pub fn hold(&mut self, name: &str) -> bool {
        self.held.insert(name.to_string())
    }

    pub fn holds(&self, name: &str) -> bool {
        self.held.contains(name)
    }

    pub fn send_reply(&self, request: RequestId, reply: Reply) -> Result<()> {
        self.peer.send_reply(request, reply)
    }

    /// Move to `Disconnected` and hand back every held name, exactly once.
    pub fn disconnect(&mut self) -> Vec<String> {
        if self.state == SessionState::Disconnected {
            return Vec::new();
        }
        self.state = SessionState::Disconnected;
        self.held.drain().collect()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.label)
            .field("state", &self.state)
            .field("held", &self.held)
            .finish()
    }
}
