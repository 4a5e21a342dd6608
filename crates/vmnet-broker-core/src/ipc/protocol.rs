//! Wire format for the broker socket.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON-RPC 2.0 payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Error objects carry the broker [`StatusCode`] as their `code`, so clients
//! can classify failures without parsing messages.

use crate::backend::NetworkSerialization;
use crate::config::BrokerLimits;
use crate::error::{BrokerError, Result, StatusCode};
use crate::router::{Operation, Reply, Request};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";
pub const METHOD_ACQUIRE: &str = "acquire";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

impl IpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }

    /// Request a lease on `network_name`.
    pub fn acquire(network_name: &str, id: u64) -> Self {
        Self::new(
            METHOD_ACQUIRE,
            serde_json::json!({ "network_name": network_name }),
            id,
        )
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
    pub id: Option<serde_json::Value>,
}

impl IpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: StatusCode, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(IpcError {
                code: i64::from(code.raw()),
                message,
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AcquireParams {
    network_name: Option<String>,
}

/// Decode a request frame.
///
/// Returns the JSON-RPC id together with the request, or a ready-made error
/// response when the frame cannot be understood at all.
pub fn decode_request(
    frame: &[u8],
) -> std::result::Result<(Option<serde_json::Value>, Request), IpcResponse> {
    let request: IpcRequest = serde_json::from_slice(frame).map_err(|e| {
        IpcResponse::error(
            None,
            StatusCode::INVALID_REQUEST,
            format!("Parse error: {}", e),
        )
    })?;

    if request.jsonrpc != JSONRPC_VERSION {
        return Err(IpcResponse::error(
            request.id,
            StatusCode::INVALID_REQUEST,
            "Invalid Request: expected jsonrpc 2.0".to_string(),
        ));
    }

    let operation = match request.method.as_str() {
        METHOD_ACQUIRE => Operation::Acquire,
        other => Operation::Unknown(other.to_string()),
    };

    let network_name = match request.params {
        None | Some(serde_json::Value::Null) => None,
        Some(params) => match serde_json::from_value::<AcquireParams>(params) {
            Ok(params) => params.network_name,
            Err(e) => {
                return Err(IpcResponse::error(
                    request.id,
                    StatusCode::INVALID_REQUEST,
                    format!("Invalid params: {}", e),
                ))
            }
        },
    };

    Ok((
        request.id,
        Request {
            operation,
            network_name,
        },
    ))
}

/// Build the response for a router reply.
pub fn encode_reply(id: Option<serde_json::Value>, reply: Reply) -> IpcResponse {
    match reply.payload {
        Some(payload) if reply.status.is_success() => IpcResponse::success(
            id,
            serde_json::json!({ "network": payload.into_value() }),
        ),
        _ => {
            let message = reply
                .message
                .unwrap_or_else(|| reply.status.to_string());
            IpcResponse::error(id, reply.status, message)
        }
    }
}

/// Turn a response frame into the network it grants, or the error it reports.
///
/// `request_id` is the id the answer must carry. Responses to earlier
/// requests on the same connection (whose caller stopped waiting) yield
/// `Ok(None)` and should be skipped; any other id is an `InvalidReply`.
pub fn decode_reply(
    frame: &[u8],
    request_id: u64,
    network_name: &str,
) -> Result<Option<NetworkSerialization>> {
    let response: IpcResponse =
        serde_json::from_slice(frame).map_err(|e| BrokerError::InvalidReply {
            message: format!("malformed response: {}", e),
        })?;

    match response.id.as_ref().and_then(serde_json::Value::as_u64) {
        Some(id) if id == request_id => {}
        Some(id) if id < request_id => return Ok(None),
        _ => {
            return Err(BrokerError::InvalidReply {
                message: format!(
                    "response id {:?} does not match request {}",
                    response.id, request_id
                ),
            })
        }
    }

    if let Some(error) = response.error {
        let code = u32::try_from(error.code)
            .map(StatusCode::from_raw)
            .unwrap_or(StatusCode::INTERNAL_ERROR);
        return Err(BrokerError::from_status(code, network_name, error.message));
    }

    let network = response
        .result
        .and_then(|mut result| result.get_mut("network").map(serde_json::Value::take))
        .filter(|network| !network.is_null())
        .ok_or_else(|| BrokerError::InvalidReply {
            message: "success reply without a network".to_string(),
        })?;

    Ok(Some(NetworkSerialization::from_value(network)))
}

fn check_frame_len(len: usize) -> Result<()> {
    if len > BrokerLimits::MAX_MESSAGE_SIZE {
        return Err(BrokerError::InvalidRequest {
            message: format!(
                "IPC message size {} exceeds maximum {}",
                len,
                BrokerLimits::MAX_MESSAGE_SIZE
            ),
        });
    }
    Ok(())
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_frame_len(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking counterpart of [`read_frame`].
pub fn read_frame_blocking<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    Ok(Some(payload))
}

/// Blocking counterpart of [`write_frame`].
pub fn write_frame_blocking<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_frame_len(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}
