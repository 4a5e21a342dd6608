//! Error types for the vmnet broker.
//!
//! Two layers live here:
//!
//! - [`StatusCode`]: the numeric status carried on the wire. An open newtype;
//!   codes from a newer peer are carried through with their raw value.
//! - [`BrokerError`]: the rich error type used inside the crate and returned by
//!   the client library. Every variant maps to a `StatusCode`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Classification of a non-success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransportFailure,
    InvalidReply,
    NotAllowed,
    InvalidRequest,
    NotFound,
    CreateFailure,
    InternalError,
}

/// Status code sent in broker replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(u32);

impl StatusCode {
    pub const SUCCESS: Self = Self(0);
    pub const TRANSPORT_FAILURE: Self = Self(1);
    pub const INVALID_REPLY: Self = Self(2);
    pub const NOT_ALLOWED: Self = Self(3);
    pub const INVALID_REQUEST: Self = Self(4);
    pub const NOT_FOUND: Self = Self(5);
    pub const CREATE_FAILURE: Self = Self(6);
    pub const INTERNAL_ERROR: Self = Self(7);

    /// Wrap a raw code, known or not.
    pub const fn from_raw(code: u32) -> Self {
        Self(code)
    }

    /// The raw numeric value, preserved even for unknown codes.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Whether this code is one this build knows about.
    pub fn is_known(self) -> bool {
        self.0 <= Self::INTERNAL_ERROR.0
    }

    /// Error classification, `None` for success.
    ///
    /// Codes this build does not recognize classify as `InternalError`.
    pub fn kind(self) -> Option<ErrorKind> {
        match self.0 {
            0 => None,
            1 => Some(ErrorKind::TransportFailure),
            2 => Some(ErrorKind::InvalidReply),
            3 => Some(ErrorKind::NotAllowed),
            4 => Some(ErrorKind::InvalidRequest),
            5 => Some(ErrorKind::NotFound),
            6 => Some(ErrorKind::CreateFailure),
            _ => Some(ErrorKind::InternalError),
        }
    }

    /// Human readable description of a known status.
    pub fn description(self) -> Option<&'static str> {
        let text = match self.0 {
            0 => "Success",
            1 => "Failed to communicate with the broker",
            2 => "Invalid reply from the broker",
            3 => "Not allowed to use the network",
            4 => "Invalid request",
            5 => "Network name not found",
            6 => "Failed to create network",
            7 => "Internal broker error",
            _ => return None,
        };
        Some(text)
    }
}

impl From<ErrorKind> for StatusCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::TransportFailure => Self::TRANSPORT_FAILURE,
            ErrorKind::InvalidReply => Self::INVALID_REPLY,
            ErrorKind::NotAllowed => Self::NOT_ALLOWED,
            ErrorKind::InvalidRequest => Self::INVALID_REQUEST,
            ErrorKind::NotFound => Self::NOT_FOUND,
            ErrorKind::CreateFailure => Self::CREATE_FAILURE,
            ErrorKind::InternalError => Self::INTERNAL_ERROR,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(text) => f.write_str(text),
            None => write!(f, "(unknown status {})", self.0),
        }
    }
}

/// Main error type for the broker and its client library.
#[derive(Debug, Error)]
pub enum BrokerError {
    // Request-level errors, reported to clients
    #[error("Failed to communicate with the broker: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid reply from the broker: {message}")]
    InvalidReply { message: String },

    #[error("Not allowed to use network '{network}'")]
    NotAllowed { network: String, uid: Option<u32> },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Network '{network}' not found")]
    NotFound { network: String },

    #[error("Failed to create network '{network}': {message}")]
    CreateFailure { network: String, message: String },

    #[error("{code}: {message}")]
    Internal { code: StatusCode, message: String },

    // Broker-side ambient errors
    #[error("Another broker is already serving {path:?}")]
    AlreadyRunning { path: PathBuf },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BrokerError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BrokerError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a transport error from an IO failure on the broker channel.
    pub fn transport(err: std::io::Error) -> Self {
        BrokerError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        BrokerError::Internal {
            code: StatusCode::INTERNAL_ERROR,
            message: message.into(),
        }
    }

    /// Wire status for this error.
    ///
    /// Ambient failures (IO, JSON, configuration) are broker-side faults from
    /// the client's point of view and report `INTERNAL_ERROR`.
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::Transport { .. } => StatusCode::TRANSPORT_FAILURE,
            BrokerError::InvalidReply { .. } => StatusCode::INVALID_REPLY,
            BrokerError::NotAllowed { .. } => StatusCode::NOT_ALLOWED,
            BrokerError::InvalidRequest { .. } => StatusCode::INVALID_REQUEST,
            BrokerError::NotFound { .. } => StatusCode::NOT_FOUND,
            BrokerError::CreateFailure { .. } => StatusCode::CREATE_FAILURE,
            BrokerError::Internal { code, .. } => *code,
            BrokerError::AlreadyRunning { .. }
            | BrokerError::Config { .. }
            | BrokerError::Io { .. }
            | BrokerError::Json { .. } => StatusCode::INTERNAL_ERROR,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.status().kind().unwrap_or(ErrorKind::InternalError)
    }

    /// Rebuild an error from a status received over the wire.
    ///
    /// `network` is the name the caller asked for; the broker does not echo it.
    /// Unknown codes become `Internal` with the raw code preserved.
    pub fn from_status(code: StatusCode, network: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let network = network.to_string();
        match code.kind() {
            Some(ErrorKind::TransportFailure) => BrokerError::Transport {
                message,
                source: None,
            },
            Some(ErrorKind::InvalidReply) => BrokerError::InvalidReply { message },
            Some(ErrorKind::NotAllowed) => BrokerError::NotAllowed { network, uid: None },
            Some(ErrorKind::InvalidRequest) => BrokerError::InvalidRequest { message },
            Some(ErrorKind::NotFound) => BrokerError::NotFound { network },
            Some(ErrorKind::CreateFailure) => BrokerError::CreateFailure { network, message },
            Some(ErrorKind::InternalError) => BrokerError::Internal { code, message },
            None => BrokerError::InvalidReply {
                message: format!("error reply carries success status: {}", message),
            },
        }
    }
}
