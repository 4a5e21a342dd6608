//! Unix socket listener for the broker service.
//!
//! The listener owns the service socket. Each accepted connection becomes a
//! [`ConnectionPeer`] registered with the broker through a
//! [`BrokerEvent::Connected`] event; frames read from the connection are
//! forwarded as [`BrokerEvent::Request`] and the end of the stream, clean or
//! not, as [`BrokerEvent::Disconnected`]. No resource logic happens here.
//!
//! # Connection tasks
//!
//! Every connection runs a reader task and a writer task. The writer owns the
//! mapping from broker [`RequestId`]s to JSON-RPC ids, so replies can be sent
//! from the broker loop without touching the socket.

use super::protocol::{decode_request, encode_reply, read_frame, write_frame, IpcResponse};
use crate::broker::BrokerEvent;
use crate::config::BrokerLimits;
use crate::error::{BrokerError, Result};
use crate::router::{Reply, RequestId};
use crate::session::{Peer, PeerInfo, SessionId};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Messages for a connection's writer task.
#[derive(Debug)]
enum Outbound {
    /// A request was forwarded to the broker under `RequestId`.
    Register(RequestId, Option<serde_json::Value>),
    Reply(RequestId, Reply),
    /// A response produced without involving the broker (malformed frames).
    Raw(IpcResponse),
}

/// Broker-side handle to one connected client.
#[derive(Debug)]
pub struct ConnectionPeer {
    info: PeerInfo,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Peer for ConnectionPeer {
    fn info(&self) -> PeerInfo {
        self.info
    }

    fn send_reply(&self, request: RequestId, reply: Reply) -> Result<()> {
        self.outbound
            .send(Outbound::Reply(request, reply))
            .map_err(|_| BrokerError::Transport {
                message: "connection closed".to_string(),
                source: None,
            })
    }
}

/// Handle to a running listener. Dropping it stops accepting and removes the
/// socket file.
pub struct ListenerHandle {
    path: PathBuf,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting new connections. Established connections are left to
    /// the broker.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("failed to remove socket {:?}: {}", self.path, e);
                }
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bound service socket, not yet accepting.
#[derive(Debug)]
pub struct Listener {
    listener: UnixListener,
    path: PathBuf,
    max_sessions: usize,
}

impl Listener {
    /// Bind the service socket at `path`.
    ///
    /// A leftover socket file nobody is accepting on is removed first. If
    /// another broker answers on it, fails with `AlreadyRunning`.
    pub async fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| BrokerError::io_with_path(e, parent))?;
        }

        if path.exists() {
            match UnixStream::connect(&path).await {
                Ok(_) => return Err(BrokerError::AlreadyRunning { path }),
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
                    info!("[main] removing stale socket {:?}", path);
                    std::fs::remove_file(&path).map_err(|e| BrokerError::io_with_path(e, &path))?;
                }
                Err(e) => return Err(BrokerError::io_with_path(e, &path)),
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| BrokerError::io_with_path(e, &path))?;
        info!("[main] listening on {:?}", path);

        Ok(Self {
            listener,
            path,
            max_sessions: BrokerLimits::MAX_SESSIONS,
        })
    }

    /// Cap on concurrently open connections. Connections beyond it are
    /// closed without reaching the broker.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start accepting connections, reporting them on `events`.
    pub fn start(self, events: mpsc::UnboundedSender<BrokerEvent>) -> ListenerHandle {
        let path = self.path.clone();
        let task_handle = tokio::spawn(accept_loop(self.listener, self.max_sessions, events));

        ListenerHandle {
            path,
            task_handle: Some(task_handle),
        }
    }
}

fn peer_info(stream: &UnixStream) -> PeerInfo {
    match stream.peer_cred() {
        Ok(cred) => PeerInfo {
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
            uid: Some(cred.uid()),
        },
        Err(e) => {
            debug!("peer credentials unavailable: {}", e);
            PeerInfo::default()
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    max_sessions: usize,
    events: mpsc::UnboundedSender<BrokerEvent>,
) {
    let active_connections = Arc::new(AtomicUsize::new(0));
    let next_session = AtomicU64::new(1);

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!("[main] accept failed: {}", e);
                let _ = events.send(BrokerEvent::ListenerFailed {
                    error: BrokerError::transport(e),
                });
                return;
            }
        };

        let info = peer_info(&stream);

        let current = active_connections.load(Ordering::Relaxed);
        if current >= max_sessions {
            warn!(
                "[{}] rejecting connection: at max capacity ({})",
                info.label(),
                max_sessions
            );
            continue;
        }

        let id = SessionId::new(next_session.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let peer = ConnectionPeer {
            info,
            outbound: outbound_tx.clone(),
        };

        if events
            .send(BrokerEvent::Connected {
                id,
                peer: Box::new(peer),
            })
            .is_err()
        {
            debug!("broker gone, accept loop exiting");
            return;
        }

        active_connections.fetch_add(1, Ordering::Relaxed);
        let conns = active_connections.clone();
        let events = events.clone();
        let label = info.label();

        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(writer, outbound_rx, label.clone()));
        tokio::spawn(async move {
            if let Err(e) = read_loop(reader, id, &events, &outbound_tx).await {
                debug!("[{}] connection ended: {}", label, e);
            }
            let _ = events.send(BrokerEvent::Disconnected { id });
            conns.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    id: SessionId,
    events: &mpsc::UnboundedSender<BrokerEvent>,
    outbound: &mpsc::UnboundedSender<Outbound>,
) -> Result<()> {
    let mut next_request = 0u64;

    loop {
        let Some(frame) = read_frame(&mut reader).await? else {
            return Ok(());
        };

        match decode_request(&frame) {
            Ok((json_id, request)) => {
                let request_id = RequestId(next_request);
                next_request += 1;

                // Register before the broker can possibly answer.
                if outbound.send(Outbound::Register(request_id, json_id)).is_err() {
                    return Ok(());
                }
                if events
                    .send(BrokerEvent::Request {
                        id,
                        request_id,
                        request,
                    })
                    .is_err()
                {
                    return Ok(());
                }
            }
            Err(response) => {
                if outbound.send(Outbound::Raw(response)).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    label: String,
) {
    let mut pending: HashMap<RequestId, Option<serde_json::Value>> = HashMap::new();

    while let Some(message) = outbound.recv().await {
        let response = match message {
            Outbound::Register(request_id, json_id) => {
                pending.insert(request_id, json_id);
                continue;
            }
            Outbound::Reply(request_id, reply) => {
                let json_id = pending.remove(&request_id).flatten();
                encode_reply(json_id, reply)
            }
            Outbound::Raw(response) => response,
        };

        let result = match serde_json::to_vec(&response) {
            Ok(bytes) => write_frame(&mut writer, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!("[{}] failed to send reply: {}", label, e);
            return;
        }
    }
}
