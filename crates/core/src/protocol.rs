//! Wire-protocol data contracts.
//!
//! Pure message shapes, no logic beyond classification and a few
//! constructors: the JSON-RPC envelope used for tool calls, the bridge's
//! client/server message unions, content items and tool definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol methods dispatched by the router.
pub mod methods {
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Error codes used in wire envelopes.
pub mod codes {
    /// Payload was not valid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Message was JSON but not a well-formed request.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Tool handler failure.
    pub const EXECUTION_ERROR: i64 = -32000;
    /// Session has not authenticated yet.
    pub const NOT_AUTHENTICATED: i64 = -32001;
    /// Per-session rate limit exceeded (HTTP 429 equivalent).
    pub const RATE_LIMITED: i64 = 429;
}

/// WebSocket close code sent on auth failures (policy violation).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Normal closure, used on shutdown and idle expiry.
pub const CLOSE_NORMAL: u16 = 1000;

// ─── JSON-RPC envelope ───────────────────────────────────────────────────────

/// Request/response id. JSON-RPC permits both strings and numbers; the
/// bridge's own clients use uuid strings, upstream providers use counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Num(u64),
    Str(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Num(n) => write!(f, "{}", n),
            RequestId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Str(s.to_string())
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Num(n)
    }
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── Bridge client messages ──────────────────────────────────────────────────

/// Every inbound bridge message is classified into exactly one of these
/// variants before any field is read. Anything that is valid JSON but
/// neither auth, ping, nor a JSON-RPC envelope lands in `Other`.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Auth { api_key: String },
    Ping,
    Rpc(JsonRpcRequest),
    Other(Value),
}

impl ClientMessage {
    pub fn classify(value: Value) -> ClientMessage {
        match value.get("type").and_then(|t| t.as_str()) {
            Some("auth") => {
                let api_key = value
                    .get("apiKey")
                    .and_then(|k| k.as_str())
                    .unwrap_or_default()
                    .to_string();
                return ClientMessage::Auth { api_key };
            }
            Some("ping") => return ClientMessage::Ping,
            _ => {}
        }
        if value.get("method").and_then(|m| m.as_str()).is_some() {
            if let Ok(req) = serde_json::from_value::<JsonRpcRequest>(value.clone()) {
                return ClientMessage::Rpc(req);
            }
        }
        ClientMessage::Other(value)
    }
}

/// Messages the bridge sends outside of JSON-RPC responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess {
        #[serde(rename = "sessionId")]
        session_id: String,
        message: String,
    },
    AuthError {
        message: String,
    },
    Pong {
        timestamp: i64,
    },
}

/// Client-side auth request, sent right after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

impl AuthRequest {
    pub fn new(api_key: &str) -> Self {
        Self {
            kind: "auth".to_string(),
            api_key: api_key.to_string(),
        }
    }
}

// ─── Tool content ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn image(data: impl Into<String>, mime_type: &str) -> Self {
        Self {
            content: vec![ContentItem::Image {
                data: data.into(),
                mime_type: mime_type.to_string(),
            }],
            is_error: false,
        }
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::Text { text: text.into() }],
            is_error: true,
        }
    }
}

// ─── Tool definitions ────────────────────────────────────────────────────────

/// Optional metadata attached to a tool definition. Never echoed in
/// `tools/list` responses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            annotations: None,
        }
    }

    pub fn with_annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = Some(annotations);
        self
    }
}

/// `tools/call` params: tool name plus optional arguments object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}
