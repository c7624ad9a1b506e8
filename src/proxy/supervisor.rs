//! Backend process supervision.
//!
//! Spawns a subprocess backend, hands its stdin/stdout to the transport,
//! keeps its stderr as diagnostics, and owns the child until it is reaped.
//! Restart policy lives in the session; this module only starts, watches
//! and stops one process.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use super::config::SubprocessParams;
use super::errors::SupervisorError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr kept for diagnostics, in bytes. Long enough for a traceback.
const STDERR_TAIL_LIMIT: usize = 2000;

/// Extra time allowed for the forced kill after the grace period.
const KILL_MARGIN: Duration = Duration::from_secs(2);

// ─── ProcessExit ─────────────────────────────────────────────────────────────

/// How a backend process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Terminating signal (unix only).
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

// ─── ProcessSupervisor ───────────────────────────────────────────────────────

/// Owner of one backend child process.
///
/// The child is moved into a watcher task that reaps it. Dropping the
/// supervisor kills the child; it never outlives its owner.
pub struct ProcessSupervisor {
    backend: String,
    pid: Option<u32>,
    terminate: Mutex<Option<oneshot::Sender<Duration>>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    stderr_tail: Arc<Mutex<String>>,
}

impl ProcessSupervisor {
    /// Start the backend process with piped stdio.
    pub fn spawn(
        backend: &str,
        params: &SubprocessParams,
    ) -> Result<(Self, ChildStdin, ChildStdout), SupervisorError> {
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args);

        for (key, value) in &params.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &params.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            backend: backend.to_string(),
            command: params.command.clone(),
            reason: e.to_string(),
        })?;

        let missing = |pipe: &'static str| SupervisorError::MissingPipe {
            backend: backend.to_string(),
            pipe,
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_stderr(
                backend.to_string(),
                stderr,
                Arc::clone(&stderr_tail),
            ));
        }

        let pid = child.id();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_child(backend.to_string(), child, terminate_rx, exit_tx));

        let supervisor = Self {
            backend: backend.to_string(),
            pid,
            terminate: Mutex::new(Some(terminate_tx)),
            exit: exit_rx,
            stderr_tail,
        };
        Ok((supervisor, stdin, stdout))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Wait until the process has exited.
    ///
    /// Returns `None` only if the watcher task vanished without reporting.
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut exit = self.exit.clone();
        let status = exit.wait_for(Option::is_some).await.ok().and_then(|s| *s);
        status
    }

    /// Ask the process to stop: SIGTERM, then a forced kill once `grace`
    /// runs out. Safe to call more than once.
    pub async fn terminate(&self, grace: Duration) -> Result<ProcessExit, SupervisorError> {
        if let Some(tx) = self.terminate.lock().take() {
            let _ = tx.send(grace);
        }

        match tokio::time::timeout(grace + KILL_MARGIN, self.wait()).await {
            Ok(Some(exit)) => Ok(exit),
            Ok(None) => Err(SupervisorError::TerminateFailed {
                backend: self.backend.clone(),
                reason: "process watcher exited without a status".into(),
            }),
            Err(_) => Err(SupervisorError::TerminateFailed {
                backend: self.backend.clone(),
                reason: format!(
                    "process still running {}ms after termination was requested",
                    (grace + KILL_MARGIN).as_millis()
                ),
            }),
        }
    }

    /// The last few kilobytes the process wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().clone()
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Reap the child, stopping it first if termination is requested or the
/// supervisor goes away.
async fn watch_child(
    backend: String,
    mut child: Child,
    mut terminate: oneshot::Receiver<Duration>,
    exit: watch::Sender<Option<ProcessExit>>,
) {
    let grace = tokio::select! {
        status = child.wait() => {
            let status = status.map(ProcessExit::from).unwrap_or_default();
            tracing::warn!(backend = %backend, code = ?status.code, signal = ?status.signal, "backend process exited");
            exit.send_replace(Some(status));
            return;
        }
        // A dropped sender means the supervisor is gone: kill immediately.
        request = &mut terminate => request.unwrap_or(Duration::ZERO),
    };

    let status = stop_child(&backend, &mut child, grace).await;
    exit.send_replace(Some(status));
}

async fn stop_child(backend: &str, child: &mut Child, grace: Duration) -> ProcessExit {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id().filter(|_| !grace.is_zero()) {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                        return status.map(ProcessExit::from).unwrap_or_default();
                    }
                    tracing::warn!(backend, grace_ms = grace.as_millis() as u64, "backend ignored SIGTERM, killing");
                }
                Err(e) => tracing::debug!(backend, error = %e, "SIGTERM failed, killing"),
            }
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(backend, error = %e, "failed to kill backend process");
    }
    child
        .wait()
        .await
        .map(ProcessExit::from)
        .unwrap_or_default()
}

/// Forward stderr lines to the log and keep a bounded tail.
async fn capture_stderr(backend: String, stderr: ChildStderr, tail: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(backend = %backend, line = %line, "backend stderr");
        push_tail(&mut tail.lock(), &line);
    }
}

fn push_tail(tail: &mut String, line: &str) {
    if !tail.is_empty() {
        tail.push('\n');
    }
    tail.push_str(line);

    if tail.len() > STDERR_TAIL_LIMIT {
        let mut cut = tail.len() - STDERR_TAIL_LIMIT;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
