//! Error types for riptide connections and the JSON-RPC wire error object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Application-defined error codes live in [-32099, -32000].
pub const SERVER_ERROR_START: i64 = -32099;
pub const SERVER_ERROR_END: i64 = -32000;

/// Error type for riptide operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No frame arrived within the sliding read deadline.
    #[error("read timed out")]
    ReadTimeout,

    /// The transport accepted fewer bytes than a full frame.
    #[error("short write on frame")]
    WriteShort,

    /// An incoming frame declared a length above the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: u64, max: u64 },

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Incoming bytes were not valid JSON.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A JSON object that is none of request, response, or notification.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The connection is closed. Returned by every send operation on a
    /// closed connection and delivered to all pending callbacks at close.
    #[error("connection closed")]
    Closed,

    /// A pending-response deadline expired before the response arrived.
    #[error("request timed out")]
    Timeout,

    /// The peer answered with a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration, caught before the engine runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// A server-scope send addressed a connection id that is not
    /// registered.
    #[error("no connection with id {0}")]
    UnknownConn(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map a handler failure to the wire error object for the reply.
    ///
    /// An explicit JSON-RPC error keeps its code; anything else becomes
    /// an opaque internal error. Details go to the log, not the peer.
    pub(crate) fn into_rpc_error(self) -> RpcError {
        match self {
            Error::Rpc {
                code,
                message,
                data,
            } => RpcError {
                code,
                message,
                data,
            },
            other => {
                tracing::debug!(error = %other, "handler error mapped to internal error");
                RpcError::internal_error()
            }
        }
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Error::Rpc {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

/// JSON-RPC 2.0 error object as it appears inside a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach arbitrary JSON details to the error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "invalid request")
    }

    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "method not found")
    }

    pub fn invalid_params() -> Self {
        Self::new(INVALID_PARAMS, "invalid params")
    }

    pub fn internal_error() -> Self {
        Self::new(INTERNAL_ERROR, "internal error")
    }
}
