//! In-memory backends for unit tests.
//!
//! `FakeBackend` speaks the line protocol over a `tokio::io::duplex` pipe;
//! `FakeConnector` hands out a fresh fake per connect and can be told to
//! fail some of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::Mutex;

use super::errors::{SessionError, TransportError, TransportErrorKind};
use super::session::{Connector, SessionOptions};
use super::config::RetryConfig;
use super::transport::{Transport, TransportOptions};

/// How the fake answers a `tools/call`.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Result(Value),
    Error(i32, String),
    /// Answer after a delay.
    Delay(Duration, Value),
    /// Exit without answering.
    Crash,
    /// Never answer.
    Silent,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeBackend {
    pub version: String,
    pub tools: Vec<String>,
    pub page_size: Option<usize>,
    pub replies: HashMap<String, Reply>,
}

type SharedWriter = Arc<Mutex<WriteHalf<DuplexStream>>>;

impl FakeBackend {
    pub fn new(tools: &[&str]) -> Self {
        Self {
            version: "2025-06-18".into(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            page_size: None,
            replies: HashMap::new(),
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.into();
        self
    }

    pub fn paged(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_reply(mut self, tool: &str, reply: Reply) -> Self {
        self.replies.insert(tool.into(), reply);
        self
    }

    /// Serve requests until the client hangs up or a `Crash` reply fires.
    pub async fn serve(self, stream: DuplexStream) {
        let (read, write) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(write));
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let id = msg["id"].clone();
            let method = msg["method"].as_str().unwrap_or_default().to_string();
            let params = msg.get("params").cloned().unwrap_or(Value::Null);

            match method.as_str() {
                "initialize" => {
                    let result = json!({
                        "protocolVersion": self.version,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "fake", "version": "0.0.1"}
                    });
                    send(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
                "notifications/initialized" => {}
                "tools/list" => {
                    let offset: usize = params["cursor"]
                        .as_str()
                        .and_then(|c| c.parse().ok())
                        .unwrap_or(0);
                    let size = self.page_size.unwrap_or(self.tools.len().max(1));
                    let page: Vec<Value> = self
                        .tools
                        .iter()
                        .skip(offset)
                        .take(size)
                        .map(|name| {
                            json!({
                                "name": name,
                                "description": format!("fake {name}"),
                                "inputSchema": {"type": "object"}
                            })
                        })
                        .collect();
                    let next = offset + size;
                    let mut result = json!({"tools": page});
                    if next < self.tools.len() {
                        result["nextCursor"] = json!(next.to_string());
                    }
                    send(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
                "tools/call" => {
                    let name = params["name"].as_str().unwrap_or_default().to_string();
                    let reply = self.replies.get(&name).cloned().unwrap_or_else(|| {
                        Reply::Result(json!({
                            "content": [{"type": "text", "text": format!("{name} ok")}],
                            "echo": params["arguments"].clone()
                        }))
                    });
                    match reply {
                        Reply::Result(result) => {
                            send(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                        }
                        Reply::Error(code, message) => {
                            let error = json!({"code": code, "message": message});
                            send(&writer, json!({"jsonrpc": "2.0", "id": id, "error": error})).await;
                        }
                        Reply::Delay(delay, result) => {
                            let writer = Arc::clone(&writer);
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                send(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result}))
                                    .await;
                            });
                        }
                        Reply::Crash => return,
                        Reply::Silent => {}
                    }
                }
                _ if !id.is_null() => {
                    let error = json!({"code": -32601, "message": format!("unknown method {method}")});
                    send(&writer, json!({"jsonrpc": "2.0", "id": id, "error": error})).await;
                }
                _ => {}
            }
        }
    }
}

async fn send(writer: &SharedWriter, msg: Value) {
    let mut line = msg.to_string();
    line.push('\n');
    let mut w = writer.lock().await;
    let _ = w.write_all(line.as_bytes()).await;
    let _ = w.flush().await;
}

/// Connects to a fresh `FakeBackend` each time.
pub(crate) struct FakeConnector {
    backend: String,
    fake: FakeBackend,
    fail_first: u32,
    max_successes: Option<u32>,
    attempts: Arc<AtomicU32>,
    successes: AtomicU32,
}

impl FakeConnector {
    pub fn new(backend: &str, fake: FakeBackend) -> Self {
        Self {
            backend: backend.to_string(),
            fake,
            fail_first: 0,
            max_successes: None,
            attempts: Arc::new(AtomicU32::new(0)),
            successes: AtomicU32::new(0),
        }
    }

    /// The first `n` connects are refused.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Only the first `n` successful connects go through; later ones fail.
    pub fn succeeding_only(mut self, n: u32) -> Self {
        self.max_successes = Some(n);
        self
    }

    /// Shared counter of connect attempts.
    pub fn attempts(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Transport, SessionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = attempt < self.fail_first
            || self
                .max_successes
                .is_some_and(|max| self.successes.load(Ordering::SeqCst) >= max);
        if refused {
            return Err(TransportError::new(
                &self.backend,
                TransportErrorKind::ConnectFailed,
                "connection refused",
            )
            .into());
        }
        self.successes.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(self.fake.clone().serve(server));
        let (read, write) = tokio::io::split(client);
        Ok(Transport::over_pipes(
            &self.backend,
            write,
            read,
            &TransportOptions::default(),
        ))
    }
}

/// Short timeouts and near-instant backoff.
pub(crate) fn fast_options() -> SessionOptions {
    SessionOptions {
        call_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        retry: RetryConfig {
            max_retries: 3,
            base_delay_ms: 5,
            max_delay_ms: 20,
        },
    }
}
