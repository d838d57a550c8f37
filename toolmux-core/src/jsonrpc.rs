//! JSON-RPC 2.0 envelope: ids, classification, and frame construction.
//!
//! The downstream protocol is JSON-RPC-shaped: request `{id, method, params}`,
//! response `{id, result}` or `{id, error: {code, message}}`, and unsolicited
//! notifications. This module classifies parsed frames by the presence of
//! `id` and `method` and builds outbound frames. It deliberately validates
//! only the envelope; params and results pass through as raw values so any
//! backend honoring the shape is tolerated.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The only protocol version accepted on either side of the gateway.
pub const VERSION: &str = "2.0";

/// Standard JSON-RPC error codes used on the front surface.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is unavailable.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A JSON-RPC request id: integer or string.
///
/// Floats, booleans, arrays, and objects are invalid ids and fail
/// classification. Null ids are treated as absent (notifications carry no
/// id at all, and the gateway never emits null-id requests).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC error object from a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A classified JSON-RPC message.
///
/// Determined by presence of `id` and `method`:
/// - both: a request expecting a response
/// - `id` only: a response to a previous request
/// - `method` only: a fire-and-forget notification
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request from the peer.
    Request {
        /// Correlation id to echo in the response.
        id: RequestId,
        /// Method name.
        method: String,
        /// The `params` member, if present.
        params: Option<Value>,
    },
    /// A response correlating to an earlier request.
    Response {
        /// The id of the originating request.
        id: RequestId,
        /// `Ok(result)` or `Err(error)` depending on which member was set.
        result: Result<Value, RpcError>,
    },
    /// A notification; no response is expected.
    Notification {
        /// Method name.
        method: String,
        /// The `params` member, if present.
        params: Option<Value>,
    },
}

/// Why a frame failed classification.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// The `jsonrpc` member is missing or not `"2.0"`.
    #[error("missing or invalid jsonrpc version")]
    InvalidVersion,
    /// The `id` member is present but not an integer or string.
    #[error("invalid id member")]
    InvalidId,
    /// The frame is a JSON array; batches are not part of the envelope.
    #[error("batch frames are not supported")]
    Batch,
    /// Neither `id` nor `method` is present.
    #[error("frame has neither id nor method")]
    Unclassifiable,
}

/// Classify a parsed frame, consuming it.
///
/// Extracts `params`/`result`/`error` by removal rather than clone.
///
/// # Errors
///
/// Returns [`ClassifyError`] when the envelope is violated: wrong or
/// missing version, invalid id type, a batch array, or a frame with
/// neither `id` nor `method`.
pub fn classify(mut value: Value) -> Result<Message, ClassifyError> {
    if value.is_array() {
        return Err(ClassifyError::Batch);
    }

    let version = value.get("jsonrpc").and_then(Value::as_str);
    if version != Some(VERSION) {
        return Err(ClassifyError::InvalidVersion);
    }

    let id = match value.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(RequestId::Number(
            n.as_i64().ok_or(ClassifyError::InvalidId)?,
        )),
        Some(Value::String(s)) => Some(RequestId::String(s.clone())),
        Some(_) => return Err(ClassifyError::InvalidId),
    };

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);

    let params = value.as_object_mut().and_then(|o| o.remove("params"));

    match (id, method) {
        (Some(id), Some(method)) => Ok(Message::Request { id, method, params }),
        (Some(id), None) => {
            let obj = value.as_object_mut().ok_or(ClassifyError::Unclassifiable)?;
            if let Some(err_val) = obj.remove("error") {
                let error: RpcError =
                    serde_json::from_value(err_val).map_err(|_| ClassifyError::Unclassifiable)?;
                Ok(Message::Response {
                    id,
                    result: Err(error),
                })
            } else {
                let result = obj.remove("result").unwrap_or(Value::Null);
                Ok(Message::Response {
                    id,
                    result: Ok(result),
                })
            }
        }
        (None, Some(method)) => Ok(Message::Notification { method, params }),
        (None, None) => Err(ClassifyError::Unclassifiable),
    }
}

/// Build a request frame.
pub fn request(id: &RequestId, method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": VERSION,
        "id": id,
        "method": method,
    });
    if let Some(params) = params {
        frame["params"] = params;
    }
    frame
}

/// Build a notification frame.
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": VERSION,
        "method": method,
    });
    if let Some(params) = params {
        frame["params"] = params;
    }
    frame
}

/// Build a success response frame.
pub fn success(id: &RequestId, result: Value) -> Value {
    json!({
        "jsonrpc": VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error response frame. A `None` id serializes as `"id": null`,
/// which is how parse-level failures are reported.
pub fn error(id: Option<&RequestId>, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}
