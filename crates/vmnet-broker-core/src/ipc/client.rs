//! Client library for acquiring networks from the broker.
//!
//! There is no release call. A lease lasts as long as the connection it was
//! granted on, so dropping a [`BrokerClient`] (or exiting the process) gives
//! every network it acquired back to the broker.
//!
//! Two flavours are provided:
//!
//! - [`BrokerClient`], an async client owning its own connection.
//! - [`acquire_network`], a blocking call that shares one connection per
//!   socket path for the whole process, kept open until exit.

use super::protocol::{
    decode_reply, read_frame, read_frame_blocking, write_frame, write_frame_blocking, IpcRequest,
};
use crate::backend::NetworkSerialization;
use crate::config::{BrokerConfig, BrokerLimits};
use crate::error::{BrokerError, ErrorKind, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

fn not_running(path: &Path, e: std::io::Error) -> BrokerError {
    BrokerError::Transport {
        message: format!("cannot connect to broker at {:?}: {}", path, e),
        source: Some(e),
    }
}

fn connection_lost() -> BrokerError {
    BrokerError::Transport {
        message: "broker closed the connection".to_string(),
        source: None,
    }
}

/// Map failures of the channel itself to `TransportFailure`; decoded broker
/// errors pass through.
fn on_channel(err: BrokerError) -> BrokerError {
    match err {
        BrokerError::Io { source: Some(e), .. } => BrokerError::transport(e),
        BrokerError::Io { message, .. } => BrokerError::Transport {
            message,
            source: None,
        },
        other => other,
    }
}

/// Like [`on_channel`], but for frames coming back from the broker: a frame
/// the broker should never have sent is a bad reply, not a bad request.
fn on_read(err: BrokerError) -> BrokerError {
    match err {
        BrokerError::InvalidRequest { message } => BrokerError::InvalidReply { message },
        other => on_channel(other),
    }
}

/// Async client holding one broker connection.
#[derive(Debug)]
pub struct BrokerClient {
    stream: Mutex<UnixStream>,
    path: PathBuf,
    next_id: AtomicU64,
}

impl BrokerClient {
    /// Connect to the broker listening at `path`.
    pub async fn connect(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let stream = tokio::time::timeout(BrokerLimits::CONNECT_TIMEOUT, UnixStream::connect(&path))
            .await
            .map_err(|_| BrokerError::Transport {
                message: format!("timed out connecting to broker at {:?}", path),
                source: None,
            })?
            .map_err(|e| not_running(&path, e))?;

        debug!("connected to broker at {:?}", path);

        Ok(Self {
            stream: Mutex::new(stream),
            path,
            next_id: AtomicU64::new(1),
        })
    }

    /// Connect to the broker at the well-known service socket.
    pub async fn connect_default() -> Result<Self> {
        Self::connect(BrokerConfig::default_socket_path()).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire a lease on `network_name` and return its serialization.
    ///
    /// Repeating the call for a name already held on this connection returns
    /// the same network without taking a second lease.
    pub async fn acquire_network(&self, network_name: &str) -> Result<NetworkSerialization> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_bytes = serde_json::to_vec(&IpcRequest::acquire(network_name, id))?;

        let mut stream = self.stream.lock().await;
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, &request_bytes)
            .await
            .map_err(on_channel)?;

        // Replies to acquires abandoned mid-flight may still be queued ahead
        // of ours.
        loop {
            let response_bytes = read_frame(&mut reader)
                .await
                .map_err(on_read)?
                .ok_or_else(connection_lost)?;

            match decode_reply(&response_bytes, id, network_name)? {
                Some(serialization) => return Ok(serialization),
                None => debug!("skipping stale reply on {:?}", self.path),
            }
        }
    }
}

type SharedConnections = StdMutex<HashMap<PathBuf, std::os::unix::net::UnixStream>>;

fn shared_connections() -> &'static SharedConnections {
    static CONNECTIONS: OnceLock<SharedConnections> = OnceLock::new();
    CONNECTIONS.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// Acquire `network_name` from the broker at the well-known service socket.
///
/// Blocks until the broker replies. The lease stays valid until the process
/// exits.
pub fn acquire_network(network_name: &str) -> Result<NetworkSerialization> {
    acquire_network_at(&BrokerConfig::default_socket_path(), network_name)
}

/// Blocking acquire against the broker listening at `path`.
///
/// The first call opens a connection that is reused by every later call for
/// the same path. After a transport failure or a malformed reply the
/// connection is discarded and the next call reconnects; leases held on the
/// old connection are gone.
pub fn acquire_network_at(path: &Path, network_name: &str) -> Result<NetworkSerialization> {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    let mut connections = shared_connections()
        .lock()
        .map_err(|_| BrokerError::internal("client connection table poisoned"))?;

    if !connections.contains_key(path) {
        let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| not_running(path, e))?;
        debug!("connected to broker at {:?}", path);
        connections.insert(path.to_path_buf(), stream);
    }

    let Some(stream) = connections.get_mut(path) else {
        return Err(BrokerError::internal("client connection missing"));
    };

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

    match exchange_blocking(stream, id, network_name) {
        Ok(serialization) => Ok(serialization),
        Err(e) => {
            if matches!(
                e.kind(),
                ErrorKind::TransportFailure | ErrorKind::InvalidReply
            ) {
                connections.remove(path);
            }
            Err(e)
        }
    }
}

fn exchange_blocking(
    stream: &mut std::os::unix::net::UnixStream,
    id: u64,
    network_name: &str,
) -> Result<NetworkSerialization> {
    let request_bytes = serde_json::to_vec(&IpcRequest::acquire(network_name, id))?;
    write_frame_blocking(stream, &request_bytes).map_err(on_channel)?;

    loop {
        let frame = read_frame_blocking(stream)
            .map_err(on_read)?
            .ok_or_else(connection_lost)?;

        if let Some(serialization) = decode_reply(&frame, id, network_name)? {
            return Ok(serialization);
        }
    }
}
