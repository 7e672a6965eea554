use serde_json::Value;

use crate::protocol;

/// Gateway-originated request failures.
///
/// Every variant maps onto exactly one JSON-RPC error envelope; the payload
/// string becomes the `data` field and is safe to show to callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("maximum concurrent sessions reached")]
    SessionQuota,

    #[error("no credentials resolved to an organization")]
    Unauthenticated,
}

impl GatewayError {
    /// JSON-RPC (code, message, data) for this failure.
    pub fn rpc_parts(&self) -> (i64, &'static str, Option<String>) {
        match self {
            GatewayError::Parse(detail) => {
                (protocol::PARSE_ERROR, "Parse error", Some(detail.clone()))
            }
            GatewayError::InvalidRequest(detail) => (
                protocol::INVALID_REQUEST,
                "Invalid Request",
                Some(detail.clone()),
            ),
            GatewayError::MethodNotFound(detail) => (
                protocol::METHOD_NOT_FOUND,
                "Method not found",
                Some(detail.clone()),
            ),
            GatewayError::InvalidParams(detail) => (
                protocol::INVALID_PARAMS,
                "Invalid params",
                Some(detail.clone()),
            ),
            GatewayError::Internal(detail) => (
                protocol::INTERNAL_ERROR,
                "Internal error",
                Some(detail.clone()),
            ),
            GatewayError::SessionQuota => (
                protocol::INTERNAL_ERROR,
                "Internal error",
                Some("Maximum concurrent sessions reached".to_string()),
            ),
            // Normally turned into an HTTP 401 before reaching the pipeline;
            // surfaces as an RPC error only on already-open transports.
            GatewayError::Unauthenticated => (
                protocol::INTERNAL_ERROR,
                "Internal error",
                Some("Unable to resolve an organization for this request".to_string()),
            ),
        }
    }

    /// The JSON-RPC error envelope for this failure, echoing `id`.
    pub fn to_response(&self, id: Value) -> Value {
        let (code, message, data) = self.rpc_parts();
        protocol::error_response(id, code, message, data)
    }
}
