//! Strict JSON-RPC 2.0 subset used for control calls.

use super::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control methods the hub answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Initialize,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcRequest {
    /// Decode and validate a request, rejecting anything but version `2.0`
    /// and the supported methods.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let req: JsonRpcRequest =
            serde_json::from_value(value).map_err(|e| ProtocolError::InvalidRpc {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        if req.jsonrpc != "2.0" {
            return Err(ProtocolError::InvalidRpc {
                id,
                reason: format!("unsupported jsonrpc version '{}'", req.jsonrpc),
            });
        }
        req.rpc_method()?;
        Ok(req)
    }

    pub fn rpc_method(&self) -> Result<RpcMethod, ProtocolError> {
        match self.method.as_str() {
            "initialize" => Ok(RpcMethod::Initialize),
            "ping" => Ok(RpcMethod::Ping),
            other => Err(ProtocolError::UnknownMethod {
                id: self.id.clone(),
                method: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: err.rpc_id(),
            result: None,
            error: Some(JsonRpcError {
                code: err.rpc_code(),
                message: err.to_string(),
            }),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
