//! JSON-RPC 2.0 message types.
//!
//! Push-servers from version 5 on speak JSON-RPC over the transport. Both
//! sides may call methods; each side answers the other's requests.
//!
//! # Formats
//!
//! Request:
//! ```json
//! { "jsonrpc": "2.0", "method": "publish", "params": { ... }, "id": 3 }
//! ```
//!
//! Success response:
//! ```json
//! { "jsonrpc": "2.0", "result": { ... }, "id": 3 }
//! ```
//!
//! Error response:
//! ```json
//! { "jsonrpc": "2.0", "error": { "code": -32601, "message": "Method not found" }, "id": 3 }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version marker.
pub const JSON_RPC_VERSION: &str = "2.0";

/// Keep-alive frame sent by the server.
pub const JSON_RPC_PING: &str = "ping";

/// Keep-alive answer sent by the client.
pub const JSON_RPC_PONG: &str = "pong";

// ============================================================================
// Methods
// ============================================================================

/// Method names used on the push-server RPC surface.
pub mod method {
    /// Publish messages to users or channels.
    pub const PUBLISH: &str = "publish";
    /// Last activity time of users.
    pub const GET_USERS_LAST_SEEN: &str = "getUsersLastSeen";
    /// Round-trip check.
    pub const PING: &str = "ping";
    /// Channels this connection listens to.
    pub const LIST_CHANNELS: &str = "listChannels";
    /// Start receiving online status of users.
    pub const SUBSCRIBE_STATUS_CHANGE: &str = "subscribeStatusChange";
    /// Stop receiving online status of users.
    pub const UNSUBSCRIBE_STATUS_CHANGE: &str = "unsubscribeStatusChange";
    /// Server-invoked message delivery.
    pub const INCOMING_MESSAGE: &str = "incoming.message";
}

// ============================================================================
// Error Codes
// ============================================================================

/// Standard JSON-RPC error codes.
pub mod code {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ============================================================================
// RpcError
// ============================================================================

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Creates an error object.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32601 Method not found`.
    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(code::METHOD_NOT_FOUND, "Method not found")
    }

    /// `-32700 Parse error`.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(code::PARSE_ERROR, "Parse error")
    }

    /// `-32602 Invalid params`.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(code::INVALID_PARAMS, message)
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        if err.code == code::METHOD_NOT_FOUND {
            return Error::method_not_found(err.message);
        }
        Error::rpc(err.code, err.message)
    }
}

// ============================================================================
// RpcRequest
// ============================================================================

/// A JSON-RPC request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,

    /// Method name.
    pub method: String,

    /// Method parameters.
    #[serde(default)]
    pub params: Value,

    /// Correlation id; `None` for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    /// Creates a request expecting an answer.
    #[must_use]
    pub fn call(method: impl Into<String>, params: Value, id: RequestId) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(Value::from(id.get())),
        }
    }

    /// Creates a notification.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }
}

// ============================================================================
// RpcResponse
// ============================================================================

/// A JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,

    /// Result (if success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (if failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,

    /// Matches the request `id`.
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcResponse {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn failure(id: Option<Value>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Returns the numeric request id, if any.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.id.as_ref().and_then(Value::as_u64).map(RequestId::new)
    }

    /// Extracts the result, converting an error object into [`Error`].
    ///
    /// # Errors
    ///
    /// - [`Error::Rpc`] / [`Error::MethodNotFound`] for an error response
    /// - [`Error::Protocol`] if neither `result` nor `error` is present
    pub fn into_result(self) -> Result<Value> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error.into()),
            (Some(result), None) => Ok(result),
            (None, None) => Err(Error::protocol("wrong response structure")),
        }
    }
}

// ============================================================================
// RpcPacket
// ============================================================================

/// Shape of an incoming JSON-RPC text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcPacket {
    /// Array of requests and/or responses.
    Batch(Vec<Value>),
    /// Single request or notification.
    Request(RpcRequest),
    /// Single response.
    Response(RpcResponse),
    /// Valid JSON of no known shape.
    Unknown(Value),
}

impl RpcPacket {
    /// Classifies a parsed JSON value.
    #[must_use]
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::Batch(items),
            Value::Object(ref map) if map.get("method").is_some_and(Value::is_string) => {
                match serde_json::from_value::<RpcRequest>(value.clone()) {
                    Ok(request) => Self::Request(request),
                    Err(_) => Self::Unknown(value),
                }
            }
            Value::Object(ref map) if map.contains_key("id") => {
                match serde_json::from_value::<RpcResponse>(value.clone()) {
                    Ok(response) => Self::Response(response),
                    Err(_) => Self::Unknown(value),
                }
            }
            other => Self::Unknown(other),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = RpcRequest::call(method::PING, json!({}), RequestId::new(3));
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "method": "ping", "params": {}, "id": 3})
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let request = RpcRequest::notification("incoming.message", json!({"mid": "a"}));
        let json = serde_json::to_string(&request).expect("serialize");
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_success_response() {
        let response: RpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "result": {"ok": true}, "id": 9}))
                .expect("parse");
        assert_eq!(response.request_id(), Some(RequestId::new(9)));
        assert_eq!(response.into_result().expect("ok")["ok"], true);
    }

    #[test]
    fn test_error_response() {
        let response: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "error": {"code": -32000, "message": "boom"},
            "id": 4
        }))
        .expect("parse");

        let err = response.into_result().unwrap_err();
        assert!(matches!(err, Error::Rpc { code: -32000, .. }));
    }

    #[test]
    fn test_method_not_found_maps_to_error_variant() {
        let err: Error = RpcError::method_not_found().into();
        assert!(matches!(err, Error::MethodNotFound { .. }));
    }

    #[test]
    fn test_response_without_result_or_error() {
        let response = RpcResponse {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            result: None,
            error: None,
            id: Some(json!(1)),
        };
        assert!(matches!(response.into_result(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            RpcPacket::classify(json!([{"jsonrpc": "2.0", "id": 1, "result": 1}])),
            RpcPacket::Batch(items) if items.len() == 1
        ));
        assert!(matches!(
            RpcPacket::classify(json!({"jsonrpc": "2.0", "method": "x", "id": 1})),
            RpcPacket::Request(_)
        ));
        assert!(matches!(
            RpcPacket::classify(json!({"jsonrpc": "2.0", "id": 1, "result": null})),
            RpcPacket::Response(_)
        ));
        assert!(matches!(
            RpcPacket::classify(json!({"hello": "world"})),
            RpcPacket::Unknown(_)
        ));
        assert!(matches!(RpcPacket::classify(json!(42)), RpcPacket::Unknown(_)));
    }
}
