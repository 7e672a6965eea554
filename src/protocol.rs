//! JSON-RPC 2.0 envelopes for MCP traffic.
//!
//! The gateway never interprets MCP payloads beyond what routing needs: the
//! decoder validates the 2.0 envelope, preserves the request `id` exactly as
//! received (number, string or null), and classifies the call into a
//! [`CallTarget`] so the router can match on a tag instead of poking into
//! untyped params.

use serde_json::{Value, json};

use crate::error::GatewayError;

/// JSON-RPC 2.0 error codes used by the gateway.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// What a request is aimed at, derived from `method` + `params` at decode
/// time. The capability key the router matches on is the tag's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// `tools/call` with `params.name`.
    ToolsCall { name: String },
    /// `resources/read` with `params.uri`.
    ResourcesRead { uri: String },
    /// `prompts/get` with `params.name`.
    PromptsGet { name: String },
    /// Anything else; the method string itself is the capability key.
    Generic { method: String },
}

impl CallTarget {
    /// The capability key used for backend resolution.
    pub fn capability(&self) -> &str {
        match self {
            CallTarget::ToolsCall { name } => name,
            CallTarget::ResourcesRead { uri } => uri,
            CallTarget::PromptsGet { name } => name,
            CallTarget::Generic { method } => method,
        }
    }
}

/// A decoded JSON-RPC request.
///
/// `id` is `None` for notifications and otherwise carries the original JSON
/// value untouched, so responses echo it bit-exactly.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
    pub target: CallTarget,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Retry policy: only read-style methods are safe to re-send.
    pub fn is_idempotent(&self) -> bool {
        self.method.ends_with("/list")
            || self.method.ends_with("/get")
            || self.method.ends_with("/read")
    }
}

/// Decode and validate a single JSON-RPC 2.0 request.
///
/// Rejects with −32700 on malformed JSON, −32600 when `jsonrpc` is not
/// exactly `"2.0"` or `method` is absent/non-string, and −32602 when a
/// param-derived target (`tools/call`, `resources/read`, `prompts/get`) is
/// missing its name/uri.
pub fn decode_request(bytes: &[u8]) -> Result<RpcRequest, GatewayError> {
    let v: Value = serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::Parse(e.to_string()))?;

    let obj = v
        .as_object()
        .ok_or_else(|| GatewayError::InvalidRequest("expected a JSON object".to_string()))?;

    match obj.get("jsonrpc").and_then(|j| j.as_str()) {
        Some("2.0") => {}
        _ => {
            return Err(GatewayError::InvalidRequest(
                "jsonrpc must be \"2.0\"".to_string(),
            ));
        }
    }

    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .ok_or_else(|| GatewayError::InvalidRequest("missing method".to_string()))?
        .to_string();

    let id = match obj.get("id") {
        None => None,
        Some(id @ (Value::Null | Value::Number(_) | Value::String(_))) => Some(id.clone()),
        Some(_) => {
            return Err(GatewayError::InvalidRequest(
                "id must be a string, number or null".to_string(),
            ));
        }
    };

    let params = obj.get("params").cloned();
    let target = classify(&method, params.as_ref())?;

    Ok(RpcRequest {
        id,
        method,
        params,
        target,
    })
}

fn classify(method: &str, params: Option<&Value>) -> Result<CallTarget, GatewayError> {
    let param_str = |key: &str| {
        params
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    match method {
        "tools/call" => param_str("name")
            .map(|name| CallTarget::ToolsCall { name })
            .ok_or_else(|| GatewayError::InvalidParams("tools/call requires params.name".to_string())),
        "resources/read" => param_str("uri")
            .map(|uri| CallTarget::ResourcesRead { uri })
            .ok_or_else(|| {
                GatewayError::InvalidParams("resources/read requires params.uri".to_string())
            }),
        "prompts/get" => param_str("name")
            .map(|name| CallTarget::PromptsGet { name })
            .ok_or_else(|| GatewayError::InvalidParams("prompts/get requires params.name".to_string())),
        _ => Ok(CallTarget::Generic {
            method: method.to_string(),
        }),
    }
}

/// Build a success response echoing the request id.
pub fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build an error response echoing the request id (`null` when the request
/// was unrecoverable).
pub fn error_response(id: Value, code: i64, message: &str, data: Option<String>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = Value::String(data);
    }
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}

/// Serialize a response envelope to bytes.
pub fn encode_response(response: &Value) -> Vec<u8> {
    // A `Value` tree cannot fail to serialize.
    serde_json::to_vec(response).unwrap_or_default()
}
