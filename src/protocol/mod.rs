//! Wire protocol spoken over hub connections.
//!
//! Two frame shapes share one socket:
//!
//! - **Envelopes** `{type, data, timestamp, client_id?, request_id?}` carry the
//!   closed set of hub message kinds (see [`Message`]).
//! - **JSON-RPC 2.0** control calls (`initialize`, `ping`) used by health
//!   probes and generic MCP clients.
//!
//! Everything here is pure parsing and serialization.

pub mod envelope;
pub mod jsonrpc;

pub use envelope::*;
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcMethod};

use serde_json::Value;

/// Protocol version reported by `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Errors raised while decoding a frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("binary frame is not valid UTF-8: {0}")]
    InvalidEncoding(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid timestamp '{0}', expected ISO-8601")]
    InvalidTimestamp(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid '{kind}' payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("invalid JSON-RPC request: {reason}")]
    InvalidRpc { id: Value, reason: String },

    #[error("method not found: {method}")]
    UnknownMethod { id: Value, method: String },
}

impl ProtocolError {
    /// JSON-RPC error code for this failure.
    pub fn rpc_code(&self) -> i32 {
        match self {
            ProtocolError::Malformed(_) => -32700,
            ProtocolError::UnknownMethod { .. } => -32601,
            ProtocolError::InvalidRpc { .. } => -32600,
            _ => -32602,
        }
    }

    /// Whether the reply should be a JSON-RPC error rather than an envelope.
    pub fn is_rpc(&self) -> bool {
        matches!(
            self,
            ProtocolError::Malformed(_)
                | ProtocolError::InvalidRpc { .. }
                | ProtocolError::UnknownMethod { .. }
        )
    }

    /// Request id to echo in a JSON-RPC error reply.
    pub fn rpc_id(&self) -> Value {
        match self {
            ProtocolError::InvalidRpc { id, .. } | ProtocolError::UnknownMethod { id, .. } => {
                id.clone()
            }
            _ => Value::Null,
        }
    }
}

impl From<ProtocolError> for crate::types::AppError {
    fn from(err: ProtocolError) -> Self {
        crate::types::AppError::Protocol(err.to_string())
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Envelope(Envelope),
    Rpc(JsonRpcRequest),
}

/// Decode one text frame.
///
/// Objects carrying `jsonrpc`, or a `method` without a `type`, are treated as
/// JSON-RPC; everything else must be a valid envelope.
pub fn parse_frame(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Some(obj) = value.as_object() else {
        return Err(ProtocolError::Malformed(
            "frame must be a JSON object".to_string(),
        ));
    };

    let is_rpc = obj.contains_key("jsonrpc")
        || (obj.contains_key("method") && !obj.contains_key("type"));
    if is_rpc {
        JsonRpcRequest::from_value(value).map(Frame::Rpc)
    } else {
        Envelope::from_value(value).map(Frame::Envelope)
    }
}
