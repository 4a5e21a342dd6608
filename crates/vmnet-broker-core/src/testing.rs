//! Test doubles shared by the unit tests.

use crate::backend::{BackendError, NetworkBackend, NetworkInstance};
use crate::config::NetworkConfig;
use crate::error::{BrokerError, Result};
use crate::router::{Reply, RequestId};
use crate::session::{Peer, PeerInfo};
use chrono::Utc;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Backend that counts calls and fails on demand.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    creates: AtomicUsize,
    destroys: AtomicUsize,
    fail_creates: AtomicBool,
    fail_destroys: AtomicBool,
    hold_creates: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose creates never complete.
    pub fn held() -> Self {
        Self {
            hold_creates: true,
            ..Self::default()
        }
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroys(&self, fail: bool) {
        self.fail_destroys.store(fail, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NetworkBackend for ScriptedBackend {
    async fn create(
        &self,
        config: &NetworkConfig,
    ) -> std::result::Result<NetworkInstance, BackendError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        if self.hold_creates {
            std::future::pending::<()>().await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(BackendError::Other("scripted create failure".to_string()));
        }
        Ok(NetworkInstance {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            mode: config.mode,
            subnet: Ipv4Addr::new(192, 168, 64 + (n % 64) as u8, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            ipv6_prefix: Ipv6Addr::new(0xfd00, 0, 0, n as u16, 0, 0, 0, 0),
            prefix_len: 64,
            created_at: Utc::now(),
        })
    }

    async fn destroy(&self, _instance: NetworkInstance) -> std::result::Result<(), BackendError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroys.load(Ordering::SeqCst) {
            return Err(BackendError::Other("scripted destroy failure".to_string()));
        }
        Ok(())
    }
}

/// Peer that records every reply it is sent. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingPeer {
    info: PeerInfo,
    replies: Arc<Mutex<Vec<(RequestId, Reply)>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pid(pid: u32) -> Self {
        Self {
            info: PeerInfo {
                pid: Some(pid),
                uid: None,
            },
            ..Self::default()
        }
    }

    pub fn with_uid(uid: u32) -> Self {
        Self {
            info: PeerInfo {
                pid: None,
                uid: Some(uid),
            },
            ..Self::default()
        }
    }

    pub fn replies(&self) -> Vec<(RequestId, Reply)> {
        self.replies.lock().unwrap().clone()
    }

    /// Make further sends fail, as if the connection dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Peer for RecordingPeer {
    fn info(&self) -> PeerInfo {
        self.info
    }

    fn send_reply(&self, request: RequestId, reply: Reply) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport {
                message: "peer closed".to_string(),
                source: None,
            });
        }
        self.replies.lock().unwrap().push((request, reply));
        Ok(())
    }
}
