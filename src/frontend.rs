//! Front-end server: line-delimited JSON-RPC on the proxy's own stdio.
//!
//! Answers `initialize`, `ping`, `tools/list` and `tools/call`. Requests
//! are handled concurrently; responses are written as they complete, so a
//! slow tool never blocks a fast one.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::proxy::types::{error_codes, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use crate::proxy::ProxyManager;

/// Serve until `reader` reaches EOF and every in-flight call has answered.
pub async fn serve<R, W>(manager: Arc<ProxyManager>, reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Value>(64);
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut segments = BufReader::new(reader).split(b'\n');
    let mut calls = JoinSet::new();

    while let Some(raw) = segments.next_segment().await? {
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        // Reap finished calls so the set does not grow without bound.
        while calls.try_join_next().is_some() {}

        let message: Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx
                    .send(error_response(Value::Null, error_codes::PARSE_ERROR, &format!("parse error: {e}"), None))
                    .await;
                continue;
            }
        };

        let manager = Arc::clone(&manager);
        let tx = tx.clone();
        calls.spawn(async move {
            if let Some(response) = handle(&manager, message).await {
                let _ = tx.send(response).await;
            }
        });
    }

    tracing::debug!("front-end input closed, draining in-flight calls");
    while calls.join_next().await.is_some() {}
    drop(tx);

    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(format!("writer task failed: {e}"))),
    }
}

/// Handle one message. Notifications get no response.
async fn handle(manager: &ProxyManager, message: Value) -> Option<Value> {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(Value::as_str);

    let Some(method) = method else {
        return id.map(|id| {
            error_response(id, error_codes::INVALID_REQUEST, "missing method", None)
        });
    };
    let Some(id) = id else {
        tracing::debug!(method, "front-end notification");
        return None;
    };
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let response = match method {
        "initialize" => success(id, initialize_result(&params)),
        "ping" => success(id, json!({})),
        "tools/list" => success(id, list_result(manager)),
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(error_response(
                    id,
                    error_codes::INVALID_PARAMS,
                    "tools/call requires a 'name'",
                    None,
                ));
            };
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match manager.route(name, arguments).await {
                Ok(result) => success(id, result),
                Err(e) => error_response(
                    id,
                    e.rpc_code(),
                    e.message(),
                    Some(json!({ "kind": e.kind(), "backend": e.backend() })),
                ),
            }
        }
        other => error_response(
            id,
            error_codes::METHOD_NOT_FOUND,
            &format!("method not found: {other}"),
            None,
        ),
    };
    Some(response)
}

fn initialize_result(params: &Value) -> Value {
    let requested = params.get("protocolVersion").and_then(Value::as_str);
    let version = requested
        .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
        .unwrap_or(LATEST_PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// One entry per advertised name; an owned alias is listed as its own entry.
fn list_result(manager: &ProxyManager) -> Value {
    let mut tools = Vec::new();
    for tool in manager.list() {
        for name in manager.listed_names(&tool) {
            tools.push(json!({
                "name": name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            }));
        }
    }
    json!({ "tools": tools })
}

fn success(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i32, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
