//! Shared types for the proxy.
//!
//! JSON-RPC 2.0 message types, the handshake payloads exchanged with
//! backends, and the uniform `ToolDescriptor` every caller sees.

use serde::{Deserialize, Serialize};

use super::config::{AliasStyle, ProxyConfig};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Split into the result payload or the error object.
    ///
    /// A response carrying neither is reported as an internal error.
    pub fn into_result(self) -> Result<serde_json::Value, JsonRpcError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.result.ok_or(JsonRpcError {
            code: error_codes::INTERNAL_ERROR,
            message: "response missing both result and error".into(),
            data: None,
        })
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── Handshake Payloads ──────────────────────────────────────────────────────

/// Protocol revisions the proxy can talk to, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// The revision offered in our own `initialize` request.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One page of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<BackendTool>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// A tool exactly as a backend reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

// ─── Tool Descriptor ─────────────────────────────────────────────────────────

/// The uniform tool shape exposed by the proxy.
///
/// Built once per discovery; a reconnect produces a fresh set that replaces
/// the old one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// Backend that owns the tool.
    pub backend: String,
    /// Name as reported by the backend.
    pub original_name: String,
    /// `namespace.backend.tool`.
    pub qualified_name: String,
    /// Compatibility alias, if aliasing is enabled.
    pub alias: Option<String>,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Builds qualified names and aliases for discovered tools.
#[derive(Debug, Clone)]
pub struct Naming {
    namespace: String,
    alias_style: Option<AliasStyle>,
}

impl Naming {
    pub fn new(namespace: &str, alias_style: Option<AliasStyle>) -> Self {
        Self {
            namespace: namespace.to_string(),
            alias_style,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        let style = config.aliases.enabled.then_some(config.aliases.style);
        Self::new(&config.namespace, style)
    }

    /// `namespace.backend.tool`.
    pub fn qualified_name(&self, backend: &str, tool: &str) -> String {
        format!("{}.{backend}.{tool}", self.namespace)
    }

    pub fn alias(&self, backend: &str, tool: &str) -> Option<String> {
        self.alias_style.map(|style| match style {
            AliasStyle::Short => format!("{backend}.{tool}"),
            AliasStyle::Bare => tool.to_string(),
            AliasStyle::Underscore => format!("{backend}_{tool}"),
        })
    }

    /// Turn a backend-reported tool into a descriptor.
    pub fn describe(&self, backend: &str, tool: BackendTool) -> ToolDescriptor {
        ToolDescriptor {
            backend: backend.to_string(),
            qualified_name: self.qualified_name(backend, &tool.name),
            alias: self.alias(backend, &tool.name),
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
            original_name: tool.name,
        }
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The proxy gave up waiting for a backend.
    pub const REQUEST_TIMEOUT: i32 = -32001;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
