//! RequestRouter — the single entry point for front-end tool calls.
//!
//! Resolves a qualified name (or alias) through the registry, hands the call
//! to the owning session, and bounds the whole thing by its own timeout so a
//! hung backend can never hang the caller. Tool-level failures are returned
//! as-is; retrying is the caller's decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::errors::{RouteError, RoutingError};
use super::registry::ToolRegistry;
use super::session::{BackendSession, SessionState};
use super::types::ToolDescriptor;

pub struct RequestRouter {
    registry: Arc<ToolRegistry>,
    sessions: HashMap<String, Arc<BackendSession>>,
    timeout: Duration,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sessions: impl IntoIterator<Item = Arc<BackendSession>>,
        timeout: Duration,
    ) -> Self {
        let sessions = sessions
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        Self {
            registry,
            sessions,
            timeout,
        }
    }

    /// The catalog as the front end sees it.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.registry.list()
    }

    /// Invoke a tool by qualified name or alias.
    pub async fn route(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, RouteError> {
        let resolved = self
            .registry
            .resolve(name)
            .ok_or_else(|| RoutingError::unknown_tool(name))?;

        let session = match self.sessions.get(&resolved.backend) {
            Some(s) if s.state() != SessionState::Closed => s,
            _ => {
                tracing::debug!(tool = name, backend = %resolved.backend, "backend is closed");
                return Err(RoutingError::unknown_tool(name).into());
            }
        };

        tracing::debug!(
            tool = name,
            backend = %resolved.backend,
            original = %resolved.descriptor.original_name,
            via_alias = resolved.via_alias,
            "routing tool call"
        );

        let call = session.invoke(&resolved.descriptor.original_name, arguments);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                tracing::warn!(tool = name, backend = %e.backend, kind = e.kind.as_str(), error = %e.message, "tool call failed");
                Err(e.into())
            }
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::warn!(tool = name, backend = %resolved.backend, timeout_ms, "tool call timed out");
                Err(RoutingError::timeout(name, &resolved.backend, timeout_ms).into())
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
