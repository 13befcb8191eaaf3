// SPDX-License-Identifier: MIT OR Apache-2.0
//! Line-delimited JSON-RPC 2.0 codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message that can appear on the wire.
///
/// Untagged: the shape decides. A `method` + `id` is a request, `method`
/// alone a notification, `id` alone a response.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// A request expecting a response.
    Request {
        /// Request id (numeric for ids we allocate; echoed verbatim).
        id: Value,
        /// Method name.
        method: String,
        /// Parameters.
        params: Value,
    },
    /// A response to a prior request.
    Response {
        /// Id of the request being answered.
        id: Value,
        /// Result payload on success.
        result: Option<Value>,
        /// Error payload on failure.
        error: Option<RpcError>,
    },
    /// A fire-and-forget notification.
    Notification {
        /// Method name.
        method: String,
        /// Parameters.
        params: Value,
    },
}

impl RpcMessage {
    /// Decode one wire line.
    ///
    /// # Errors
    ///
    /// Returns the JSON parse error, or an invalid-shape error for objects
    /// that are neither request, response, nor notification.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_str(line)?)
    }

    /// Classify an already-parsed wire value.
    ///
    /// # Errors
    ///
    /// Returns an invalid-shape error for objects that are neither request,
    /// response, nor notification.
    pub fn from_value(v: Value) -> Result<Self, serde_json::Error> {
        let method = v.get("method").and_then(Value::as_str);
        let id = v.get("id").cloned();

        Ok(match (method, id) {
            (Some(method), Some(id)) => Self::Request {
                id,
                method: method.to_string(),
                params: v.get("params").cloned().unwrap_or(Value::Null),
            },
            (Some(method), None) => Self::Notification {
                method: method.to_string(),
                params: v.get("params").cloned().unwrap_or(Value::Null),
            },
            (None, Some(id)) => Self::Response {
                id,
                result: v.get("result").cloned(),
                error: v
                    .get("error")
                    .cloned()
                    .and_then(|e| serde_json::from_value(e).ok()),
            },
            (None, None) => {
                return Err(serde::de::Error::custom(
                    "object is neither request, response, nor notification",
                ));
            }
        })
    }

    /// Encode to a newline-terminated wire line.
    ///
    /// # Errors
    ///
    /// Propagates JSON serialization failures.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let v = match self {
            Self::Request { id, method, params } => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            Self::Response { id, result, error } => match error {
                Some(error) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": error,
                }),
                None => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result.clone().unwrap_or(Value::Null),
                }),
            },
            Self::Notification { method, params } => serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
        };
        let mut line = serde_json::to_string(&v)?;
        line.push('\n');
        Ok(line)
    }
}

/// Monotonically increasing numeric request-id allocator.
#[derive(Debug, Default)]
pub struct RequestIdGen {
    next: AtomicI64,
}

impl RequestIdGen {
    /// Create an allocator starting at 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_request() {
        let msg =
            RpcMessage::decode(r#"{"jsonrpc":"2.0","id":7,"method":"session/new","params":{}}"#)
                .unwrap();
        match msg {
            RpcMessage::Request { id, method, .. } => {
                assert_eq!(id, json!(7));
                assert_eq!(method, "session/new");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_notification() {
        let msg = RpcMessage::decode(
            r#"{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"s"}}"#,
        )
        .unwrap();
        assert!(matches!(msg, RpcMessage::Notification { .. }));
    }

    #[test]
    fn decode_success_response() {
        let msg = RpcMessage::decode(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).unwrap();
        match msg {
            RpcMessage::Response { result, error, .. } => {
                assert_eq!(result.unwrap()["ok"], true);
                assert!(error.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_error_response() {
        let msg = RpcMessage::decode(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":401,"message":"no auth"}}"#,
        )
        .unwrap();
        match msg {
            RpcMessage::Response { error, .. } => {
                let error = error.unwrap();
                assert_eq!(error.code, 401);
                assert_eq!(error.message, "no auth");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_shapeless_object() {
        assert!(RpcMessage::decode(r#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn encode_roundtrips() {
        let msg = RpcMessage::Request {
            id: json!(3),
            method: "initialize".into(),
            params: json!({"protocolVersion": 1}),
        };
        let line = msg.encode().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(RpcMessage::decode(line.trim_end()).unwrap(), msg);
    }

    #[test]
    fn ids_increase_monotonically() {
        let ids = RequestIdGen::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        assert!(a < b && b < c);
    }
}
