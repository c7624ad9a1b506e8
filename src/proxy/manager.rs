//! ProxyManager — high-level interface over all backends.
//!
//! Owns the registry, one session per enabled backend, and the router.
//! This is the API used by the front-end server and the binary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::ProxyConfig;
use super::errors::{RouteError, StartError};
use super::registry::ToolRegistry;
use super::router::RequestRouter;
use super::session::{BackendSession, SessionState};
use super::types::ToolDescriptor;

/// Operator-facing snapshot of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub kind: &'static str,
    pub state: SessionState,
    pub tools: usize,
    pub restarts: u32,
    pub last_ready: Option<DateTime<Utc>>,
}

pub struct ProxyManager {
    registry: Arc<ToolRegistry>,
    /// Configuration order.
    sessions: Vec<Arc<BackendSession>>,
    router: RequestRouter,
    alias_only: bool,
}

impl ProxyManager {
    /// Build sessions for every enabled backend. Nothing is started yet.
    pub fn new(config: &ProxyConfig) -> Self {
        let registry = Arc::new(ToolRegistry::from_config(config));
        let sessions = config
            .enabled_backends()
            .map(|descriptor| BackendSession::for_descriptor(descriptor, config, Arc::clone(&registry)))
            .collect();
        Self::from_sessions(registry, sessions, config.timeouts.call())
            .with_alias_only(config.aliases.only)
    }

    pub fn from_sessions(
        registry: Arc<ToolRegistry>,
        sessions: Vec<Arc<BackendSession>>,
        call_timeout: std::time::Duration,
    ) -> Self {
        let router = RequestRouter::new(Arc::clone(&registry), sessions.iter().cloned(), call_timeout);
        Self {
            registry,
            sessions,
            router,
            alias_only: false,
        }
    }

    /// List tools that own an alias under the alias alone.
    pub fn with_alias_only(mut self, alias_only: bool) -> Self {
        self.alias_only = alias_only;
        self
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every backend concurrently.
    ///
    /// Returns the backends that failed to start (partial startup is OK).
    pub async fn start_all(&self) -> Vec<StartError> {
        for session in &self.sessions {
            self.registry.declare(session.name());
        }

        let results = futures::future::join_all(self.sessions.iter().map(|s| s.start())).await;
        let errors: Vec<StartError> = results.into_iter().filter_map(Result::err).collect();

        tracing::info!(
            backends = self.sessions.len(),
            ready = self.ready_count(),
            failed = errors.len(),
            tools = self.registry.len(),
            "backend startup complete"
        );
        errors
    }

    /// Shut down every backend. Idempotent.
    pub async fn shutdown_all(&self) {
        futures::future::join_all(self.sessions.iter().map(|s| s.shutdown())).await;
        tracing::info!("all backends shut down");
    }

    // ─── Front-end API ───────────────────────────────────────────────────

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.router.list()
    }

    pub async fn route(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, RouteError> {
        self.router.route(name, arguments).await
    }

    /// Names a catalog entry is advertised under. Qualified names route
    /// either way; a tool without an owned alias keeps its qualified name.
    pub fn listed_names<'a>(&self, tool: &'a ToolDescriptor) -> Vec<&'a str> {
        match tool.alias.as_deref() {
            Some(alias) if self.alias_only => vec![alias],
            Some(alias) => vec![tool.qualified_name.as_str(), alias],
            None => vec![tool.qualified_name.as_str()],
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn status(&self) -> Vec<BackendStatus> {
        self.sessions
            .iter()
            .map(|s| BackendStatus {
                name: s.name().to_string(),
                kind: s.kind(),
                state: s.state(),
                tools: self.registry.tools_for_backend(s.name()),
                restarts: s.restarts(),
                last_ready: s.last_ready(),
            })
            .collect()
    }

    /// Number of backends currently `Ready`.
    pub fn ready_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_healthy()).count()
    }

    /// Names of all configured (enabled) backends, in configuration order.
    pub fn backend_names(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.name().to_string()).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
