//! Correlated JSON-RPC transport.
//!
//! A `Transport` pairs an outbound channel (a child's stdin, or HTTP POSTs
//! to a stream endpoint) with an inbound sequence of frames (stdout lines,
//! or `message` events). One dispatcher task per transport reads the inbound
//! frames and hands each response to the caller waiting on its id, so
//! responses may arrive in any order.
//!
//! Variants:
//! - [`stdio`]: line-delimited JSON over a child process's stdio
//! - [`sse`]: server-sent events in, HTTP POST out

pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::config::TimeoutConfig;
use super::errors::{TransportError, TransportErrorKind};
use super::supervisor::ProcessSupervisor;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
///
/// Ids are unique across every transport in the process, so a late reply
/// can never be mistaken for the answer to a newer call.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// Bounds applied by a transport and its connectors.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upper bound on a single outbound write.
    pub write_timeout: Duration,
    /// Upper bound on opening the channel (waiting for a stream endpoint).
    pub connect_timeout: Duration,
    /// Grace period before a child process is force-killed.
    pub shutdown_grace: Duration,
}

impl TransportOptions {
    pub fn from_config(timeouts: &TimeoutConfig) -> Self {
        Self {
            write_timeout: timeouts.write(),
            connect_timeout: timeouts.handshake(),
            shutdown_grace: timeouts.shutdown_grace(),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

// ─── Channels ────────────────────────────────────────────────────────────────

/// Inbound frames, one JSON text per item. Ends when the channel closes.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Where outbound messages go.
pub(crate) enum Outbound {
    /// Newline-terminated JSON written to a pipe.
    Pipe(tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>),
    /// JSON POSTed to the endpoint announced by a stream.
    Post {
        client: reqwest::Client,
        endpoint: reqwest::Url,
        credential: Option<String>,
    },
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Marks the transport closed and fails every outstanding call when the
/// dispatcher ends, including when it is aborted.
struct CloseGuard {
    open: watch::Sender<bool>,
    pending: PendingMap,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.open.send_replace(false);
        // Dropping the senders wakes every waiter with a closed error.
        self.pending.lock().clear();
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC channel to one backend.
pub struct Transport {
    backend: String,
    outbound: Outbound,
    pending: PendingMap,
    open: watch::Receiver<bool>,
    dispatcher: JoinHandle<()>,
    write_timeout: Duration,
    shutdown_grace: Duration,
    process: Option<ProcessSupervisor>,
}

impl Transport {
    /// Assemble a transport and start its dispatcher.
    pub(crate) fn new(
        backend: &str,
        outbound: Outbound,
        frames: FrameStream,
        options: &TransportOptions,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (open_tx, open_rx) = watch::channel(true);
        let guard = CloseGuard {
            open: open_tx,
            pending: Arc::clone(&pending),
        };
        let dispatcher = tokio::spawn(dispatch(backend.to_string(), frames, guard));

        Self {
            backend: backend.to_string(),
            outbound,
            pending,
            open: open_rx,
            dispatcher,
            write_timeout: options.write_timeout,
            shutdown_grace: options.shutdown_grace,
            process: None,
        }
    }

    /// Attach the child process this transport talks to.
    pub(crate) fn with_process(mut self, process: ProcessSupervisor) -> Self {
        self.process = Some(process);
        self
    }

    /// Send a request and return a handle to its eventual response.
    ///
    /// The handle must be awaited or dropped; dropping it releases the
    /// waiting slot and any late reply is discarded.
    pub async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<PendingCall, TransportError> {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let call = PendingCall {
            id,
            backend: self.backend.clone(),
            rx,
            pending: Arc::clone(&self.pending),
        };

        // Checked after insertion: the dispatcher flips `open` before it
        // clears the map, so a closed channel is always noticed here.
        if !self.is_open() {
            return Err(TransportError::new(
                &self.backend,
                TransportErrorKind::WriteFailed,
                "channel is closed",
            ));
        }

        self.write(&JsonRpcRequest::new(id, method, params)).await?;
        Ok(call)
    }

    /// Send a request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        self.send(method, params).await?.response().await
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        self.write(&JsonRpcNotification::new(method, params)).await
    }

    async fn write<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let write_failed =
            |reason: String| TransportError::new(&self.backend, TransportErrorKind::WriteFailed, reason);

        let attempt = async {
            match &self.outbound {
                Outbound::Pipe(writer) => {
                    let mut json = serde_json::to_string(message)
                        .map_err(|e| write_failed(format!("failed to serialize message: {e}")))?;
                    json.push('\n');

                    let mut writer = writer.lock().await;
                    writer
                        .write_all(json.as_bytes())
                        .await
                        .map_err(|e| write_failed(format!("failed to write to stdin: {e}")))?;
                    writer
                        .flush()
                        .await
                        .map_err(|e| write_failed(format!("failed to flush stdin: {e}")))
                }
                Outbound::Post {
                    client,
                    endpoint,
                    credential,
                } => {
                    let mut request = client.post(endpoint.clone()).json(message);
                    if let Some(token) = credential {
                        request = request.bearer_auth(token);
                    }
                    let response = request
                        .send()
                        .await
                        .map_err(|e| write_failed(format!("POST {endpoint} failed: {e}")))?;
                    let status = response.status();
                    if status.is_success() {
                        Ok(())
                    } else {
                        Err(write_failed(format!("POST {endpoint} returned {status}")))
                    }
                }
            }
        };

        tokio::time::timeout(self.write_timeout, attempt)
            .await
            .map_err(|_| {
                write_failed(format!(
                    "write timed out after {}ms",
                    self.write_timeout.as_millis()
                ))
            })?
    }

    /// Whether the inbound side is still delivering.
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Resolves once the channel is gone: inbound EOF, read failure, or
    /// (for subprocess backends) process exit.
    pub async fn closed(&self) {
        let mut open = self.open.clone();
        let inbound_closed = async move {
            let _ = open.wait_for(|open| !*open).await;
        };

        match &self.process {
            Some(process) => {
                tokio::select! {
                    _ = inbound_closed => {}
                    _ = process.wait() => {}
                }
            }
            None => inbound_closed.await,
        }
    }

    /// Tear down the channel. For subprocess backends this terminates the
    /// child (signal, then kill after the grace period).
    pub async fn close(&self) {
        if let Some(process) = &self.process {
            match process.terminate(self.shutdown_grace).await {
                Ok(exit) => {
                    tracing::debug!(backend = %self.backend, ?exit, "backend process terminated");
                }
                Err(e) => tracing::warn!(backend = %self.backend, error = %e, "terminate failed"),
            }
        }
        self.dispatcher.abort();
    }

    /// Recent stderr output of the backend process, for diagnostics.
    pub fn stderr_tail(&self) -> Option<String> {
        self.process
            .as_ref()
            .map(|p| p.stderr_tail())
            .filter(|tail| !tail.is_empty())
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

// ─── PendingCall ─────────────────────────────────────────────────────────────

/// An in-flight request waiting for its correlated response.
pub struct PendingCall {
    id: u64,
    backend: String,
    rx: oneshot::Receiver<JsonRpcResponse>,
    pending: PendingMap,
}

impl PendingCall {
    pub fn correlation_id(&self) -> u64 {
        self.id
    }

    /// Wait for the response. Fails with `Closed` if the channel goes away first.
    pub async fn response(mut self) -> Result<JsonRpcResponse, TransportError> {
        (&mut self.rx)
            .await
            .map_err(|_| TransportError::closed(&self.backend))
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

async fn dispatch(backend: String, mut frames: FrameStream, guard: CloseGuard) {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(text) => deliver(&backend, &text, &guard.pending),
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "inbound channel failed");
                break;
            }
        }
    }
    tracing::debug!(backend = %backend, "inbound channel ended");
    drop(guard);
}

/// Hand one inbound frame to whoever is waiting for it.
fn deliver(backend: &str, text: &str, pending: &PendingMap) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(backend, error = %e, "skipping malformed frame");
            return;
        }
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        tracing::debug!(backend, method, "ignoring backend-initiated message");
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(backend, error = %e, "skipping non-response frame");
            return;
        }
    };
    let Some(id) = response.id else {
        tracing::debug!(backend, "skipping response without id");
        return;
    };

    let waiter = pending.lock().remove(&id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => tracing::debug!(backend, id, "discarding response nobody is waiting for"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn reply(&mut self, id: &Value, result: Value) {
            let msg = json!({"jsonrpc": "2.0", "id": id, "result": result});
            self.send_raw(&msg.to_string()).await;
        }
    }

    fn pair() -> (Transport, Peer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(client);
        let transport = Transport::over_pipes("t", write, read, &TransportOptions::default());
        let (sr, sw) = tokio::io::split(server);
        let peer = Peer {
            lines: BufReader::new(sr).lines(),
            writer: sw,
        };
        (transport, peer)
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate() {
        let (transport, mut peer) = pair();

        let first = transport.send("tools/call", Some(json!({"n": 1}))).await.unwrap();
        let second = transport.send("tools/call", Some(json!({"n": 2}))).await.unwrap();
        assert_ne!(first.correlation_id(), second.correlation_id());

        let req1 = peer.next_request().await;
        let req2 = peer.next_request().await;
        assert_eq!(req1["params"]["n"], 1);

        // Answer in reverse order.
        peer.reply(&req2["id"], json!({"which": 2})).await;
        peer.reply(&req1["id"], json!({"which": 1})).await;

        let r1 = first.response().await.unwrap();
        let r2 = second.response().await.unwrap();
        assert_eq!(r1.result.unwrap()["which"], 1);
        assert_eq!(r2.result.unwrap()["which"], 2);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_noise_and_notifications_skipped() {
        let (transport, mut peer) = pair();
        let call = transport.send("ping", None).await.unwrap();
        let req = peer.next_request().await;

        peer.send_raw("starting server on stdio...").await;
        peer.send_raw(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#)
            .await;
        peer.send_raw("").await;
        peer.reply(&req["id"], json!({})).await;

        let resp = call.response().await.unwrap();
        assert_eq!(resp.id, req["id"].as_u64());
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_non_utf8_line_keeps_channel_open() {
        let (transport, mut peer) = pair();
        let call = transport.send("ping", None).await.unwrap();
        let req = peer.next_request().await;

        peer.writer.write_all(b"d\xe9marrage du serveur\n").await.unwrap();
        peer.reply(&req["id"], json!({})).await;

        let resp = call.response().await.unwrap();
        assert_eq!(resp.id, req["id"].as_u64());
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_eof_fails_pending_calls() {
        let (transport, peer) = pair();
        let call = transport.send("tools/call", None).await.unwrap();

        drop(peer);

        let err = call.response().await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Closed);
        transport.closed().await;
        assert!(!transport.is_open());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_is_write_failed() {
        let (transport, peer) = pair();
        drop(peer);
        transport.closed().await;

        let err = transport.send("ping", None).await.err().unwrap();
        assert_eq!(err.kind, TransportErrorKind::WriteFailed);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_releases_slot_and_late_reply_is_discarded() {
        let (transport, mut peer) = pair();

        let abandoned = transport.send("tools/call", None).await.unwrap();
        assert_eq!(transport.pending_count(), 1);
        let stale = peer.next_request().await;
        drop(abandoned);
        assert_eq!(transport.pending_count(), 0);

        let fresh = transport.send("tools/call", None).await.unwrap();
        let req = peer.next_request().await;

        peer.reply(&stale["id"], json!({"late": true})).await;
        peer.reply(&req["id"], json!({"late": false})).await;

        let resp = fresh.response().await.unwrap();
        assert_eq!(resp.result.unwrap()["late"], false);
    }

    #[tokio::test]
    async fn test_timed_out_wait_leaves_no_state() {
        let (transport, mut peer) = pair();
        let call = transport.send("slow", None).await.unwrap();
        let _ = peer.next_request().await;

        let outcome =
            tokio::time::timeout(Duration::from_millis(20), call.response()).await;
        assert!(outcome.is_err());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_response_delivered() {
        let (transport, mut peer) = pair();
        let call = transport.send("tools/call", None).await.unwrap();
        let req = peer.next_request().await;
        let msg = json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "error": {"code": -32602, "message": "bad args"}
        });
        peer.send_raw(&msg.to_string()).await;

        let err = call.response().await.unwrap().into_result().unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn test_notification_written_without_id() {
        let (transport, mut peer) = pair();
        transport
            .notify("notifications/initialized", None)
            .await
            .unwrap();
        let msg = peer.next_request().await;
        assert_eq!(msg["method"], "notifications/initialized");
        assert!(msg.get("id").is_none());
    }
}
