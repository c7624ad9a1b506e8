//! End-to-end tests against a real subprocess backend.

#![cfg(unix)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde_json::{json, Value};
use toolmux::proxy::{load_config, ProxyManager, SessionState};

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/time_backend.sh")
}

fn write_config(dir: &Path, backend: &str) -> PathBuf {
    let path = dir.join("toolmux.yaml");
    let yaml = format!(
        r#"
namespace: ns
retry:
  max_retries: 2
  base_delay_ms: 10
  max_delay_ms: 50
timeouts:
  call_ms: 5000
  handshake_ms: 5000
  shutdown_grace_ms: 500
backends:
{backend}
"#
    );
    std::fs::write(&path, yaml).unwrap();
    path
}

fn time_backend() -> String {
    format!(
        "  - name: t\n    kind: subprocess\n    command: sh\n    args: [\"{}\"]\n",
        fixture().display()
    )
}

fn crashable_backend() -> String {
    format!("{}    env:\n      TIME_BACKEND_CRASHABLE: \"1\"\n", time_backend())
}

fn missing_backend() -> String {
    "  - name: t\n    kind: subprocess\n    command: /nonexistent/toolmux-missing-backend\n".to_string()
}

#[tokio::test]
async fn test_subprocess_backend_discovery_and_call() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&write_config(dir.path(), &time_backend())).unwrap();
    let manager = ProxyManager::new(&config);

    assert!(manager.start_all().await.is_empty());

    let names: Vec<String> = manager.list().into_iter().map(|t| t.qualified_name).collect();
    assert_eq!(names, vec!["ns.t.get_time", "ns.t.convert_time"]);

    let result = manager.route("ns.t.get_time", json!({})).await.unwrap();
    assert_eq!(
        result,
        json!({"content": [{"type": "text", "text": "2026-01-01T12:00:00Z"}], "isError": false})
    );

    let err = manager
        .route("ns.t.convert_time", json!({"tz": "Mars/Olympus"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_arguments");
    assert_eq!(err.backend(), Some("t"));

    manager.shutdown_all().await;
    assert_eq!(manager.status()[0].state, SessionState::Closed);
    assert!(manager.list().is_empty());
}

#[tokio::test]
async fn test_backend_exit_triggers_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&write_config(dir.path(), &crashable_backend())).unwrap();
    let manager = ProxyManager::new(&config);
    assert!(manager.start_all().await.is_empty());
    assert_eq!(manager.list().len(), 3);

    let err = manager.route("ns.t.crash", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), "backend_internal");

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = &manager.status()[0];
            if status.restarts == 1 && status.state == SessionState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("backend was not restarted");

    let names: Vec<String> = manager.list().into_iter().map(|t| t.qualified_name).collect();
    assert_eq!(names, vec!["ns.t.get_time", "ns.t.convert_time", "ns.t.crash"]);
    assert!(manager.route("ns.t.get_time", json!({})).await.is_ok());
    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_missing_command_closes_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&write_config(dir.path(), &missing_backend())).unwrap();
    let manager = ProxyManager::new(&config);

    let failures = manager.start_all().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].backend, "t");
    assert_eq!(failures[0].attempts, 3);

    assert_eq!(manager.status()[0].state, SessionState::Closed);
    assert!(manager.list().is_empty());
    assert_eq!(manager.ready_count(), 0);
    manager.shutdown_all().await;
}

#[test]
fn test_binary_serves_catalog_over_stdio() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &time_backend());

    let mut child = Command::new(env!("CARGO_BIN_EXE_toolmux"))
        .arg("--config")
        .arg(&config)
        .env("RUST_LOG", "off")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    {
        let mut stdin = child.stdin.take().unwrap();
        let requests = [
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "ns.t.get_time", "arguments": {}}}),
        ];
        for request in requests {
            writeln!(stdin, "{request}").unwrap();
        }
    }

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());

    let responses: Vec<Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let by_id = |id: i64| responses.iter().find(|r| r["id"] == id).unwrap();

    let tools: Vec<&str> = by_id(2)["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(tools, vec!["ns.t.get_time", "ns.t.convert_time"]);
    assert_eq!(by_id(3)["result"]["content"][0]["text"], "2026-01-01T12:00:00Z");
}

#[test]
fn test_binary_exits_nonzero_when_nothing_starts() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &missing_backend());

    let status = Command::new(env!("CARGO_BIN_EXE_toolmux"))
        .arg("--config")
        .arg(&config)
        .env("RUST_LOG", "off")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}
