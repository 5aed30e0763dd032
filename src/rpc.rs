//! JSON-RPC 2.0 framing types shared by the HTTP and stdio transports.
//!
//! Only framing lives here; MCP method semantics are in [`crate::mcp`].
//! Notifications (messages without an `id`) never receive a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    /// Absent for notifications; present (and echoed back) for requests.
    pub id: Option<Value>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_without_id_is_a_notification() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(req.is_notification());
        assert_eq!(req.method, "notifications/initialized");
    }

    #[test]
    fn error_response_omits_result() {
        let resp = Response::err(json!(7), METHOD_NOT_FOUND, "Method not found");
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("\"id\":7"));
        assert!(text.contains("-32601"));
        assert!(!text.contains("result"));
    }

    #[test]
    fn ok_response_omits_error() {
        let resp = Response::ok(json!("a"), json!({"tools": []}));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(!text.contains("error"));
        assert!(text.contains("\"jsonrpc\":\"2.0\""));
    }

    #[test]
    fn params_default_to_null() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(req.params.is_null());
        assert!(!req.is_notification());
    }
}
