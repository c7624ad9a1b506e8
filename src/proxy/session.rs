//! Backend session — one backend's connection, handshake and health.
//!
//! ```text
//! Disconnected → Connecting → Handshaking → Ready ⇄ Degraded
//!                     ↘            ↘          ↘        ↘
//!                                 Closed (terminal)
//! ```
//!
//! A session acquires a transport through its [`Connector`], negotiates the
//! protocol version, pages through `tools/list`, and publishes the result to
//! the registry. A worker task then watches the channel: when it drops (or a
//! call fails at the transport level) the session degrades, hides its tools,
//! and reconnects with exponential backoff. Exhausting the retry budget
//! closes the session for good and removes its tools.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::{BackendDescriptor, BackendKind, ProxyConfig, RetryConfig};
use super::errors::{HandshakeError, SessionError, StartError, ToolError, ToolErrorKind};
use super::registry::ToolRegistry;
use super::transport::sse::StreamConnector;
use super::transport::stdio::SubprocessConnector;
use super::transport::{Transport, TransportOptions};
use super::types::{
    InitializeResult, JsonRpcResponse, ListToolsResult, Naming, ToolDescriptor,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on `tools/list` pages, against backends that loop on a cursor.
const MAX_TOOL_PAGES: usize = 100;

// ─── State ───────────────────────────────────────────────────────────────────

/// Health of a backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Degraded,
    /// Terminal.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Opens a fresh transport to a backend. Called once per (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport, SessionError>;
}

/// Pick the connector matching a backend's kind.
pub fn connector_for(descriptor: &BackendDescriptor, options: TransportOptions) -> Box<dyn Connector> {
    match &descriptor.kind {
        BackendKind::Subprocess(params) => Box::new(SubprocessConnector::new(
            &descriptor.name,
            params.clone(),
            options,
        )),
        BackendKind::Stream(params) => Box::new(StreamConnector::new(
            &descriptor.name,
            params.clone(),
            options,
        )),
    }
}

/// Timeouts and retry policy for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long `invoke` waits for a response, including any wait for the
    /// session to come back from `Degraded`.
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
    pub retry: RetryConfig,
}

impl SessionOptions {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            call_timeout: config.timeouts.session_call(),
            handshake_timeout: config.timeouts.handshake(),
            retry: config.retry.clone(),
        }
    }
}

// ─── BackendSession ──────────────────────────────────────────────────────────

/// Runtime state bound 1:1 to a configured backend.
pub struct BackendSession {
    name: String,
    kind: &'static str,
    connector: Box<dyn Connector>,
    naming: Naming,
    registry: Arc<ToolRegistry>,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    transport: RwLock<Option<Arc<Transport>>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    restarts: AtomicU32,
    last_ready: RwLock<Option<DateTime<Utc>>>,
}

impl BackendSession {
    pub fn new(
        name: &str,
        kind: &'static str,
        connector: Box<dyn Connector>,
        naming: Naming,
        registry: Arc<ToolRegistry>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            name: name.to_string(),
            kind,
            connector,
            naming,
            registry,
            options,
            state,
            transport: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            shutdown,
            worker: Mutex::new(None),
            restarts: AtomicU32::new(0),
            last_ready: RwLock::new(None),
        })
    }

    /// Build a session for a configured backend.
    pub fn for_descriptor(
        descriptor: &BackendDescriptor,
        config: &ProxyConfig,
        registry: Arc<ToolRegistry>,
    ) -> Arc<Self> {
        let connector = connector_for(descriptor, TransportOptions::from_config(&config.timeouts));
        Self::new(
            &descriptor.name,
            descriptor.kind.as_str(),
            connector,
            Naming::from_config(config),
            registry,
            SessionOptions::from_config(config),
        )
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Only `Ready` counts as healthy.
    pub fn is_healthy(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Tools from the most recent successful discovery.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().clone()
    }

    /// Successful reconnects since startup.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn last_ready(&self) -> Option<DateTime<Utc>> {
        *self.last_ready.read()
    }

    /// Move to `next` unless already there or closed. Returns whether the
    /// state changed.
    fn set_state(&self, next: SessionState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            if *state == next || *state == SessionState::Closed {
                return false;
            }
            previous = *state;
            *state = next;
            true
        });
        if changed {
            tracing::info!(
                backend = %self.name,
                from = previous.as_str(),
                to = next.as_str(),
                "session state changed"
            );
        }
        changed
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Bring the backend up, retrying with backoff, then start the worker
    /// that keeps it up.
    ///
    /// On failure the session is `Closed` and has no tools registered.
    pub async fn start(self: &Arc<Self>) -> Result<(), StartError> {
        match self.state() {
            SessionState::Disconnected => {}
            SessionState::Closed => {
                return Err(StartError {
                    backend: self.name.clone(),
                    attempts: 0,
                    source: SessionError::Closed {
                        backend: self.name.clone(),
                    },
                })
            }
            _ => return Ok(()),
        }

        self.registry.declare(&self.name);
        let retry = &self.options.retry;
        let mut attempt: u32 = 0;

        loop {
            let error = match self.establish().await {
                Ok(()) => break,
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= retry.max_retries {
                tracing::error!(
                    backend = %self.name,
                    attempts = attempt + 1,
                    error = %error,
                    "backend failed to start"
                );
                self.close_permanently().await;
                return Err(StartError {
                    backend: self.name.clone(),
                    attempts: attempt + 1,
                    source: error,
                });
            }

            let delay = retry.delay_for(attempt);
            attempt += 1;
            tracing::warn!(
                backend = %self.name,
                attempt,
                max_retries = retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "backend start failed, retrying"
            );
            self.set_state(SessionState::Disconnected);
            if !self.backoff(delay).await {
                return Err(StartError {
                    backend: self.name.clone(),
                    attempts: attempt,
                    source: SessionError::Closed {
                        backend: self.name.clone(),
                    },
                });
            }
        }

        let worker = tokio::spawn(Arc::clone(self).supervise());
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    /// Connect, handshake, discover, publish. One attempt.
    async fn establish(&self) -> Result<(), SessionError> {
        let closed = || SessionError::Closed {
            backend: self.name.clone(),
        };
        if !self.set_state(SessionState::Connecting) && self.state() == SessionState::Closed {
            return Err(closed());
        }

        let transport = Arc::new(self.connector.connect().await?);
        if !self.set_state(SessionState::Handshaking) {
            transport.close().await;
            return Err(closed());
        }

        let discovered =
            match tokio::time::timeout(self.options.handshake_timeout, self.handshake(&transport))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(HandshakeError::Timeout {
                    backend: self.name.clone(),
                    timeout_ms: self.options.handshake_timeout.as_millis() as u64,
                }),
            };
        let tools = match discovered {
            Ok(tools) => tools,
            Err(e) => {
                if let Some(stderr) = transport.stderr_tail() {
                    tracing::warn!(
                        backend = %self.name,
                        stderr = %stderr,
                        "backend stderr captured on handshake failure"
                    );
                }
                transport.close().await;
                return Err(e.into());
            }
        };

        *self.transport.write() = Some(Arc::clone(&transport));
        *self.tools.write() = tools.clone();
        if !self.set_state(SessionState::Ready) {
            self.transport.write().take();
            transport.close().await;
            return Err(closed());
        }
        *self.last_ready.write() = Some(Utc::now());
        self.registry.register(&self.name, tools);
        Ok(())
    }

    /// Negotiate the protocol version and page through the tool list.
    async fn handshake(&self, transport: &Transport) -> Result<Vec<ToolDescriptor>, HandshakeError> {
        let params = serde_json::json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self
            .handshake_result(transport.request("initialize", Some(params)).await?)?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            HandshakeError::Malformed {
                backend: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            }
        })?;

        match init.protocol_version.as_deref() {
            Some(version) if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) => {
                return Err(HandshakeError::IncompatibleVersion {
                    backend: self.name.clone(),
                    version: version.to_string(),
                });
            }
            Some(version) => tracing::debug!(backend = %self.name, version, "protocol negotiated"),
            None => tracing::debug!(backend = %self.name, "backend did not state a protocol version"),
        }

        transport.notify("notifications/initialized", None).await?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = self.handshake_result(transport.request("tools/list", params).await?)?;
            let page: ListToolsResult = serde_json::from_value(result).map_err(|e| {
                HandshakeError::Malformed {
                    backend: self.name.clone(),
                    reason: format!("failed to parse tools/list response: {e}"),
                }
            })?;

            tools.extend(
                page.tools
                    .into_iter()
                    .map(|tool| self.naming.describe(&self.name, tool)),
            );
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => {
                    tracing::info!(backend = %self.name, tools = tools.len(), "discovered backend tools");
                    return Ok(tools);
                }
            }
        }

        Err(HandshakeError::Malformed {
            backend: self.name.clone(),
            reason: format!("tools/list still paginating after {MAX_TOOL_PAGES} pages"),
        })
    }

    fn handshake_result(&self, response: JsonRpcResponse) -> Result<serde_json::Value, HandshakeError> {
        response
            .into_result()
            .map_err(|e| HandshakeError::Rejected {
                backend: self.name.clone(),
                code: e.code,
                message: e.message,
            })
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Call a tool by the name the backend knows it as.
    ///
    /// Successful results are returned exactly as the backend sent them.
    pub async fn invoke(
        &self,
        original_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let deadline = Instant::now() + self.options.call_timeout;
        let tool_error =
            |kind: ToolErrorKind, message: String| ToolError::new(&self.name, original_name, kind, message);

        let transport = self.ready_transport(original_name, deadline).await?;

        let params = serde_json::json!({ "name": original_name, "arguments": arguments });
        let call = match transport.send("tools/call", Some(params)).await {
            Ok(call) => call,
            Err(e) => {
                self.report_failure(&transport, &e.to_string());
                return Err(tool_error(ToolErrorKind::BackendInternal, e.to_string()));
            }
        };

        let response = match tokio::time::timeout_at(deadline, call.response()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.report_failure(&transport, &e.to_string());
                return Err(tool_error(
                    ToolErrorKind::BackendInternal,
                    format!("backend connection lost during call: {}", e.reason),
                ));
            }
            Err(_) => {
                let ms = self.options.call_timeout.as_millis();
                self.report_failure(&transport, &format!("no response within {ms}ms"));
                return Err(tool_error(
                    ToolErrorKind::Timeout,
                    format!("no response within {ms}ms"),
                ));
            }
        };

        tool_result(&self.name, original_name, response)
    }

    /// Wait (until `deadline`) for a usable transport.
    async fn ready_transport(
        &self,
        tool: &str,
        deadline: Instant,
    ) -> Result<Arc<Transport>, ToolError> {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                SessionState::Ready => {
                    if let Some(transport) = self.transport.read().clone() {
                        return Ok(transport);
                    }
                }
                SessionState::Closed | SessionState::Disconnected => {
                    return Err(ToolError::new(
                        &self.name,
                        tool,
                        ToolErrorKind::BackendInternal,
                        format!("backend '{}' is {}", self.name, current.as_str()),
                    ));
                }
                SessionState::Connecting | SessionState::Handshaking | SessionState::Degraded => {}
            }

            match tokio::time::timeout_at(deadline, state.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(ToolError::new(
                        &self.name,
                        tool,
                        ToolErrorKind::BackendInternal,
                        "session dropped",
                    ))
                }
                Err(_) => {
                    return Err(ToolError::new(
                        &self.name,
                        tool,
                        ToolErrorKind::Timeout,
                        format!("backend '{}' did not become ready in time", self.name),
                    ))
                }
            }
        }
    }

    /// A call on `transport` hit a channel-level failure: degrade the
    /// session so the worker reconnects.
    fn report_failure(&self, transport: &Arc<Transport>, reason: &str) {
        let current = self
            .transport
            .read()
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, transport));
        if !current {
            return;
        }

        let degraded = self.state.send_if_modified(|state| {
            if *state == SessionState::Ready {
                *state = SessionState::Degraded;
                true
            } else {
                false
            }
        });
        if degraded {
            tracing::warn!(backend = %self.name, reason, "session degraded");
            self.registry.mark_unavailable(&self.name);
        }
    }

    // ─── Worker ──────────────────────────────────────────────────────────

    /// Watch the live transport and reconnect when it fails.
    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let current = self.transport.read().clone();
            let Some(transport) = current else {
                break;
            };
            let mut state = self.state.subscribe();

            tokio::select! {
                _ = transport.closed() => {
                    self.report_failure(&transport, "channel closed");
                }
                _ = wait_until(&mut state, |s| *s != SessionState::Ready) => {}
                _ = wait_until(&mut shutdown, |stop| *stop) => break,
            }

            if *shutdown.borrow() || self.state() == SessionState::Closed {
                break;
            }

            self.transport.write().take();
            transport.close().await;
            drop(transport);

            if !self.recover().await {
                break;
            }
        }
        tracing::debug!(backend = %self.name, "session worker stopped");
    }

    /// Reconnect with backoff. Returns `false` once the session is closed.
    async fn recover(&self) -> bool {
        let retry = &self.options.retry;
        for attempt in 0..retry.max_retries {
            let delay = retry.delay_for(attempt);
            tracing::info!(
                backend = %self.name,
                attempt = attempt + 1,
                max_retries = retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "reconnecting backend"
            );
            if !self.backoff(delay).await {
                return false;
            }

            match self.establish().await {
                Ok(()) => {
                    let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::info!(backend = %self.name, restarts, "backend recovered");
                    return true;
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(backend = %self.name, error = %e, "backend cannot recover");
                    break;
                }
                Err(e) => {
                    tracing::warn!(backend = %self.name, error = %e, "reconnect failed");
                    self.set_state(SessionState::Degraded);
                }
            }
        }

        tracing::error!(
            backend = %self.name,
            max_retries = retry.max_retries,
            "backend retries exhausted, closing"
        );
        self.close_permanently().await;
        false
    }

    /// Sleep for `delay` unless shutdown arrives first.
    async fn backoff(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_until(&mut shutdown, |stop| *stop) => false,
        }
    }

    async fn close_permanently(&self) {
        self.set_state(SessionState::Closed);
        self.registry.deregister(&self.name);
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    /// Close the session from any state. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.close_permanently().await;

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }
    }
}

async fn wait_until<T>(rx: &mut watch::Receiver<T>, done: impl FnMut(&T) -> bool) {
    let _ = rx.wait_for(done).await;
}

/// Map a `tools/call` response onto the uniform result/error shape.
fn tool_result(
    backend: &str,
    tool: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, ToolError> {
    let result = response.into_result().map_err(|e| {
        ToolError::new(backend, tool, ToolErrorKind::from_rpc_code(e.code), e.message).with_data(e.data)
    })?;

    if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        let text: Vec<&str> = result["content"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item["type"] == "text")
                    .filter_map(|item| item["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        let message = if text.is_empty() {
            "tool reported an error".to_string()
        } else {
            text.join("\n")
        };
        return Err(
            ToolError::new(backend, tool, ToolErrorKind::BackendInternal, message)
                .with_data(Some(result)),
        );
    }

    Ok(result)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::CollisionPolicy;
    use crate::proxy::testing::{fast_options, FakeBackend, FakeConnector, Reply};
    use serde_json::json;

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new(CollisionPolicy::Reject, false))
    }

    fn session(connector: FakeConnector, registry: &Arc<ToolRegistry>) -> Arc<BackendSession> {
        BackendSession::new(
            "t",
            "subprocess",
            Box::new(connector),
            Naming::new("ns", None),
            Arc::clone(registry),
            fast_options(),
        )
    }

    async fn wait_for_state(session: &BackendSession, target: SessionState) {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    async fn wait_for_recovery(session: &BackendSession) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(session.restarts() >= 1 && session.is_healthy()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session did not recover");
    }

    #[tokio::test]
    async fn test_start_discovers_and_registers() {
        let registry = registry();
        let session = session(
            FakeConnector::new("t", FakeBackend::new(&["get_time", "convert_time"])),
            &registry,
        );
        assert_eq!(session.state(), SessionState::Disconnected);

        session.start().await.unwrap();

        assert!(session.is_healthy());
        assert!(session.last_ready().is_some());
        let names: Vec<_> = registry.list().into_iter().map(|t| t.qualified_name).collect();
        assert_eq!(names, vec!["ns.t.get_time", "ns.t.convert_time"]);
        assert_eq!(session.tools().len(), 2);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_paginated_discovery() {
        let registry = registry();
        let fake = FakeBackend::new(&["a", "b", "c", "d", "e"]).paged(2);
        let session = session(FakeConnector::new("t", fake), &registry);
        session.start().await.unwrap();
        assert_eq!(registry.tools_for_backend("t"), 5);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_incompatible_version_closes_without_retry() {
        let registry = registry();
        let connector = FakeConnector::new("t", FakeBackend::new(&["x"]).with_version("1999-01-01"));
        let attempts = connector.attempts();
        let session = session(connector, &registry);

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err.source,
            SessionError::Handshake(HandshakeError::IncompatibleVersion { .. })
        ));
        assert_eq!(err.attempts, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted_closes_session() {
        let registry = registry();
        let connector = FakeConnector::new("t", FakeBackend::new(&["x"])).failing_first(u32::MAX);
        let attempts = connector.attempts();
        let session = session(connector, &registry);

        let err = session.start().await.unwrap_err();
        // One initial attempt plus max_retries.
        assert_eq!(err.attempts, 4);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_transient_start_failures_recover() {
        let registry = registry();
        let connector = FakeConnector::new("t", FakeBackend::new(&["x"])).failing_first(2);
        let session = session(connector, &registry);
        session.start().await.unwrap();
        assert!(session.is_healthy());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_invoke_returns_result_unchanged() {
        let registry = registry();
        let reply = json!({"content": [{"type": "text", "text": "12:00"}], "meta": {"tz": "UTC"}});
        let fake = FakeBackend::new(&["get_time"]).with_reply("get_time", Reply::Result(reply.clone()));
        let session = session(FakeConnector::new("t", fake), &registry);
        session.start().await.unwrap();

        let result = session.invoke("get_time", json!({})).await.unwrap();
        assert_eq!(result, reply);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_invoke_maps_backend_errors() {
        let registry = registry();
        let fake = FakeBackend::new(&["a", "b", "c", "d"])
            .with_reply("a", Reply::Error(-32601, "no such tool".into()))
            .with_reply("b", Reply::Error(-32602, "bad tz".into()))
            .with_reply("c", Reply::Error(-32000, "exploded".into()))
            .with_reply(
                "d",
                Reply::Result(json!({
                    "isError": true,
                    "content": [{"type": "text", "text": "disk full"}]
                })),
            );
        let session = session(FakeConnector::new("t", fake), &registry);
        session.start().await.unwrap();

        let err = session.invoke("a", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);
        let err = session.invoke("b", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidArguments);
        assert_eq!(err.message, "bad tz");
        let err = session.invoke("c", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::BackendInternal);
        let err = session.invoke("d", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::BackendInternal);
        assert_eq!(err.message, "disk full");
        assert!(err.data.is_some());

        // Tool-level errors leave the session healthy.
        assert!(session.is_healthy());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_mid_call_recovers() {
        let registry = registry();
        let fake = FakeBackend::new(&["ok", "crash"]).with_reply("crash", Reply::Crash);
        let session = session(FakeConnector::new("t", fake), &registry);
        session.start().await.unwrap();

        let err = session.invoke("crash", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::BackendInternal);

        // The worker reconnects and republishes the tools.
        wait_for_recovery(&session).await;
        assert_eq!(registry.tools_for_backend("t"), 2);
        assert!(session.invoke("ok", json!({})).await.is_ok());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_without_recovery_removes_tools() {
        let registry = registry();
        let fake = FakeBackend::new(&["crash"]).with_reply("crash", Reply::Crash);
        let connector = FakeConnector::new("t", fake).succeeding_only(1);
        let session = session(connector, &registry);
        session.start().await.unwrap();
        assert_eq!(registry.len(), 1);

        let _ = session.invoke("crash", json!({})).await;
        wait_for_state(&session, SessionState::Closed).await;
        assert!(registry.list().is_empty());
        assert!(registry.resolve("ns.t.crash").is_none());
    }

    #[tokio::test]
    async fn test_response_timeout_degrades_then_recovers() {
        let registry = registry();
        let fake = FakeBackend::new(&["hang"]).with_reply("hang", Reply::Silent);
        let mut options = fast_options();
        options.call_timeout = Duration::from_millis(100);
        let session = BackendSession::new(
            "t",
            "subprocess",
            Box::new(FakeConnector::new("t", fake)),
            Naming::new("ns", None),
            Arc::clone(&registry),
            options,
        );
        session.start().await.unwrap();

        let err = session.invoke("hang", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Timeout);

        wait_for_recovery(&session).await;
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_reply_within_timeout() {
        let registry = registry();
        let fake = FakeBackend::new(&["slow"])
            .with_reply("slow", Reply::Delay(Duration::from_millis(50), json!({"done": true})));
        let session = session(FakeConnector::new("t", fake), &registry);
        session.start().await.unwrap();
        let result = session.invoke("slow", json!({})).await.unwrap();
        assert_eq!(result["done"], true);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let registry = registry();
        let session = session(FakeConnector::new("t", FakeBackend::new(&["x"])), &registry);
        session.start().await.unwrap();

        session.shutdown().await;
        session.shutdown().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
        let err = session.invoke("x", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::BackendInternal);
        assert!(session.start().await.is_err());
    }

    #[test]
    fn test_tool_result_passthrough() {
        let response: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "result": {"content": []}
        }))
        .unwrap();
        assert_eq!(tool_result("t", "x", response).unwrap(), json!({"content": []}));
    }

    #[test]
    fn test_tool_result_is_error_without_text() {
        let response: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "result": {"isError": true, "content": []}
        }))
        .unwrap();
        let err = tool_result("t", "x", response).unwrap_err();
        assert_eq!(err.message, "tool reported an error");
    }
}
