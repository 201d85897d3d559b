//! JSON-RPC 2.0 message types for LSP communication.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32_700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32_600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32_601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32_602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32_603;
/// A request arrived before `initialize`.
pub const SERVER_NOT_INITIALIZED: i64 = -32_002;
/// The client cancelled the request.
pub const REQUEST_CANCELLED: i64 = -32_800;
/// The document changed while the request was running.
pub const CONTENT_MODIFIED: i64 = -32_801;

/// Request identifier; servers may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric identifier, used for every request the host sends.
    Number(i64),
    /// String identifier.
    String(String),
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(formatter, "{number}"),
            Self::String(text) => write!(formatter, "\"{text}\""),
        }
    }
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier.
    pub id: RequestId,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version.
    pub jsonrpc: String,
    /// Identifier of the request being answered; `null` when the request
    /// itself could not be read.
    pub id: Option<RequestId>,
    /// The result on success. A `null` result deserialises as `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful reply to `id`.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Error reply to `id`.
    #[must_use]
    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Errors raised while classifying an incoming payload.
#[derive(Debug, Clone, Error)]
pub enum MessageError {
    /// The payload was not valid JSON or did not fit the expected shape.
    #[error("malformed JSON-RPC payload: {source}")]
    Malformed {
        /// Decoder error.
        #[source]
        source: Arc<serde_json::Error>,
    },
    /// Valid JSON that is neither a request, a notification nor a response.
    #[error("payload is not a JSON-RPC message")]
    Unclassified,
}

impl From<serde_json::Error> for MessageError {
    fn from(source: serde_json::Error) -> Self {
        Self::Malformed {
            source: Arc::new(source),
        }
    }
}

/// Any message a server can send to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Answer to one of the host's requests.
    Response(JsonRpcResponse),
    /// Request initiated by the server.
    ServerRequest(JsonRpcRequest),
    /// Notification from the server.
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Classifies a payload by the fields it carries.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] for invalid JSON or an unrecognised shape.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Some(object) = value.as_object() else {
            return Err(MessageError::Unclassified);
        };

        let has_method = object.contains_key("method");
        let has_id = object.contains_key("id");
        let is_reply = object.contains_key("result") || object.contains_key("error");

        match (has_method, has_id) {
            (true, true) => Ok(Self::ServerRequest(serde_json::from_value(value)?)),
            (true, false) => Ok(Self::Notification(serde_json::from_value(value)?)),
            (false, true) if is_reply => Ok(Self::Response(serde_json::from_value(value)?)),
            _ => Err(MessageError::Unclassified),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn serialises_request_without_params() {
        let request = JsonRpcRequest::new(RequestId::from(42), "shutdown", None);
        let json = serde_json::to_string(&request).expect("serialisation failed");

        assert!(json.contains(r#""id":42"#));
        assert!(json.contains(r#""method":"shutdown""#));
        assert!(!json.contains("params"));
    }

    #[rstest]
    fn serialises_null_success_result() {
        let response = JsonRpcResponse::success(RequestId::String("a".into()), Value::Null);
        let json = serde_json::to_value(&response).expect("serialisation failed");

        assert_eq!(json, json!({"jsonrpc": "2.0", "id": "a", "result": null}));
    }

    #[rstest]
    fn serialises_error_reply_without_result() {
        let response = JsonRpcResponse::failure(RequestId::from(7), METHOD_NOT_FOUND, "nope");
        let json = serde_json::to_value(&response).expect("serialisation failed");

        assert_eq!(
            json,
            json!({"jsonrpc": "2.0", "id": 7, "error": {"code": -32601, "message": "nope"}})
        );
    }

    #[rstest]
    #[case(br#"{"jsonrpc":"2.0","id":1,"result":{"contents":"x"}}"#.as_slice())]
    #[case(br#"{"jsonrpc":"2.0","id":"s-1","result":null}"#.as_slice())]
    #[case(br#"{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"bad","data":{}}}"#.as_slice())]
    fn classifies_responses(#[case] payload: &[u8]) {
        let message = JsonRpcMessage::from_slice(payload).expect("payload should parse");
        assert!(matches!(message, JsonRpcMessage::Response(_)));
    }

    #[rstest]
    fn classifies_server_requests_with_string_ids() {
        let payload = br#"{"jsonrpc":"2.0","id":"cfg","method":"workspace/configuration","params":{"items":[]}}"#;
        let message = JsonRpcMessage::from_slice(payload).expect("payload should parse");

        match message {
            JsonRpcMessage::ServerRequest(request) => {
                assert_eq!(request.id, RequestId::String("cfg".into()));
                assert_eq!(request.method, "workspace/configuration");
            }
            other => panic!("expected server request, got {other:?}"),
        }
    }

    #[rstest]
    fn classifies_notifications() {
        let payload = br#"{"jsonrpc":"2.0","method":"window/logMessage","params":{"type":3,"message":"hi"}}"#;
        let message = JsonRpcMessage::from_slice(payload).expect("payload should parse");
        assert!(matches!(message, JsonRpcMessage::Notification(n) if n.method == "window/logMessage"));
    }

    #[rstest]
    #[case(b"[1, 2]".as_slice())]
    #[case(br#"{"jsonrpc":"2.0"}"#.as_slice())]
    #[case(br#"{"jsonrpc":"2.0","id":3}"#.as_slice())]
    fn rejects_unclassifiable_payloads(#[case] payload: &[u8]) {
        assert!(matches!(
            JsonRpcMessage::from_slice(payload),
            Err(MessageError::Unclassified)
        ));
    }

    #[rstest]
    fn rejects_invalid_json() {
        assert!(matches!(
            JsonRpcMessage::from_slice(b"{not json"),
            Err(MessageError::Malformed { .. })
        ));
    }
}
