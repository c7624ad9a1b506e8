//! Proxy error types.
//!
//! Transport, supervisor and handshake failures are recovered inside the
//! owning session and only ever show up to callers as a health change.
//! `ToolError` and `RoutingError` reach the front end verbatim, wrapped in
//! [`RouteError`] so callers get one shape: kind, message, backend.

use serde::Serialize;
use thiserror::Error;

use super::types::error_codes;

// ─── Transport ───────────────────────────────────────────────────────────────

/// What went wrong on a transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The channel could not be opened.
    ConnectFailed,
    /// Writing a request failed or timed out.
    WriteFailed,
    /// Reading from the channel failed.
    ReadFailed,
    /// A frame could not be decoded.
    MalformedFrame,
    /// The channel is closed (EOF, process exit, dropped stream).
    Closed,
}

/// Channel-level failure on one backend's transport.
#[derive(Debug, Clone, Error)]
#[error("transport error for backend '{backend}' ({kind:?}): {reason}")]
pub struct TransportError {
    pub backend: String,
    pub kind: TransportErrorKind,
    pub reason: String,
}

impl TransportError {
    pub fn new(backend: &str, kind: TransportErrorKind, reason: impl Into<String>) -> Self {
        Self {
            backend: backend.to_string(),
            kind,
            reason: reason.into(),
        }
    }

    pub fn closed(backend: &str) -> Self {
        Self::new(backend, TransportErrorKind::Closed, "channel closed")
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Errors raised while managing a backend's child process.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// The OS refused to start the process (missing binary, bad cwd, ...).
    #[error("failed to spawn backend '{backend}' ({command}): {reason}")]
    SpawnFailed {
        backend: String,
        command: String,
        reason: String,
    },

    /// A stdio pipe was not captured.
    #[error("backend '{backend}': failed to capture {pipe}")]
    MissingPipe {
        backend: String,
        pipe: &'static str,
    },

    /// The process did not go away within the grace period.
    #[error("backend '{backend}' failed to terminate: {reason}")]
    TerminateFailed {
        backend: String,
        reason: String,
    },
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Capability negotiation or tool discovery failed.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    /// The backend answered `initialize` or `tools/list` with an error.
    #[error("backend '{backend}' rejected the handshake [{code}]: {message}")]
    Rejected {
        backend: String,
        code: i32,
        message: String,
    },

    /// The backend speaks a protocol revision we do not support.
    #[error("backend '{backend}' advertised unsupported protocol version '{version}'")]
    IncompatibleVersion {
        backend: String,
        version: String,
    },

    /// A handshake payload did not have the expected shape.
    #[error("backend '{backend}' sent a malformed handshake response: {reason}")]
    Malformed {
        backend: String,
        reason: String,
    },

    #[error("backend '{backend}' handshake timed out after {timeout_ms}ms")]
    Timeout {
        backend: String,
        timeout_ms: u64,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HandshakeError {
    /// Protocol mismatches will not fix themselves on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::IncompatibleVersion { .. })
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Why a session could not (re)establish its backend.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The session was shut down or is permanently closed.
    #[error("backend '{backend}' is closed")]
    Closed { backend: String },
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handshake(e) => e.is_retryable(),
            Self::Closed { .. } => false,
            Self::Supervisor(_) | Self::Transport(_) => true,
        }
    }
}

/// A session never reached `Ready` during startup and is now `Closed`.
#[derive(Debug, Clone, Error)]
#[error("backend '{backend}' failed to start after {attempts} attempt(s): {source}")]
pub struct StartError {
    pub backend: String,
    pub attempts: u32,
    #[source]
    pub source: SessionError,
}

// ─── Tool ────────────────────────────────────────────────────────────────────

/// Failure categories a backend can report for a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    NotFound,
    InvalidArguments,
    BackendInternal,
    Timeout,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidArguments => "invalid_arguments",
            Self::BackendInternal => "backend_internal",
            Self::Timeout => "timeout",
        }
    }

    /// Map a JSON-RPC error code from a backend onto a tool error kind.
    pub fn from_rpc_code(code: i32) -> Self {
        match code {
            error_codes::METHOD_NOT_FOUND => Self::NotFound,
            error_codes::INVALID_PARAMS => Self::InvalidArguments,
            _ => Self::BackendInternal,
        }
    }
}

/// A tool call failed on (or on the way to) its backend.
#[derive(Debug, Clone, Error)]
#[error("tool '{tool}' on backend '{backend}' failed ({}): {message}", .kind.as_str())]
pub struct ToolError {
    pub backend: String,
    pub tool: String,
    pub kind: ToolErrorKind,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(backend: &str, tool: &str, kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            backend: backend.to_string(),
            tool: tool.to_string(),
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Option<serde_json::Value>) -> Self {
        self.data = data;
        self
    }
}

// ─── Routing ─────────────────────────────────────────────────────────────────

/// Proxy-level routing failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingErrorKind {
    UnknownTool,
    Timeout,
}

impl RoutingErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::Timeout => "timeout",
        }
    }
}

/// The router could not deliver a call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RoutingError {
    pub name: String,
    pub kind: RoutingErrorKind,
    pub backend: Option<String>,
    pub message: String,
}

impl RoutingError {
    pub fn unknown_tool(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: RoutingErrorKind::UnknownTool,
            backend: None,
            message: format!("unknown tool: '{name}'"),
        }
    }

    pub fn timeout(name: &str, backend: &str, timeout_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            kind: RoutingErrorKind::Timeout,
            backend: Some(backend.to_string()),
            message: format!("tool call '{name}' timed out after {timeout_ms}ms"),
        }
    }
}

/// The uniform error shape returned by `route`.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl RouteError {
    /// Stable snake_case kind, shared by both families.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tool(e) => e.kind.as_str(),
            Self::Routing(e) => e.kind.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Tool(e) => &e.message,
            Self::Routing(e) => &e.message,
        }
    }

    /// Name of the backend the failure originated from, when known.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::Tool(e) => Some(&e.backend),
            Self::Routing(e) => e.backend.as_deref(),
        }
    }

    /// JSON-RPC error code used when the failure is reported to the front end.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::Routing(e) => match e.kind {
                RoutingErrorKind::UnknownTool => error_codes::METHOD_NOT_FOUND,
                RoutingErrorKind::Timeout => error_codes::REQUEST_TIMEOUT,
            },
            Self::Tool(e) => match e.kind {
                ToolErrorKind::NotFound => error_codes::METHOD_NOT_FOUND,
                ToolErrorKind::InvalidArguments => error_codes::INVALID_PARAMS,
                ToolErrorKind::Timeout => error_codes::REQUEST_TIMEOUT,
                ToolErrorKind::BackendInternal => error_codes::INTERNAL_ERROR,
            },
        }
    }
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Configuration loading or validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    /// Two backends share a name, which would make qualified names collide.
    #[error("duplicate backend name: '{name}'")]
    DuplicateBackend { name: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Tests ───────────────────────────────────────────────────────────────────
