//! JSON-RPC over stdio.
//!
//! One JSON object per line on the child's stdin/stdout. Stderr never
//! reaches this module; the supervisor keeps it for diagnostics.

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

use super::{FrameStream, Outbound, Transport, TransportOptions};
use crate::proxy::config::SubprocessParams;
use crate::proxy::errors::{SessionError, TransportError, TransportErrorKind};
use crate::proxy::session::Connector;
use crate::proxy::supervisor::ProcessSupervisor;

/// Split a byte stream into non-empty lines.
///
/// Lines that are not valid UTF-8 are skipped; only an I/O error ends the
/// stream.
pub fn line_frames<R>(backend: &str, reader: R) -> FrameStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let segments = BufReader::new(reader).split(b'\n');
    let backend = backend.to_string();

    Box::pin(stream::unfold(
        (segments, backend),
        |(mut segments, backend)| async move {
            loop {
                match segments.next_segment().await {
                    Ok(Some(raw)) => {
                        let line = match String::from_utf8(raw) {
                            Ok(line) => line,
                            Err(e) => {
                                let err = TransportError::new(
                                    &backend,
                                    TransportErrorKind::MalformedFrame,
                                    format!("line is not valid UTF-8: {}", e.utf8_error()),
                                );
                                tracing::warn!(backend = %backend, error = %err, "skipping undecodable line");
                                continue;
                            }
                        };
                        let line = line.trim_end_matches('\r');
                        if line.trim().is_empty() {
                            continue;
                        }
                        return Some((Ok(line.to_string()), (segments, backend)));
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        let err = TransportError::new(
                            &backend,
                            TransportErrorKind::ReadFailed,
                            format!("failed to read from stdout: {e}"),
                        );
                        return Some((Err(err), (segments, backend)));
                    }
                }
            }
        },
    ))
}

impl Transport {
    /// Build a line-delimited transport over any pair of pipes.
    pub fn over_pipes<W, R>(backend: &str, writer: W, reader: R, options: &TransportOptions) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let outbound = Outbound::Pipe(tokio::sync::Mutex::new(Box::new(writer)));
        Transport::new(backend, outbound, line_frames(backend, reader), options)
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Opens a transport by spawning the backend's process.
pub struct SubprocessConnector {
    backend: String,
    params: SubprocessParams,
    options: TransportOptions,
}

impl SubprocessConnector {
    pub fn new(backend: &str, params: SubprocessParams, options: TransportOptions) -> Self {
        Self {
            backend: backend.to_string(),
            params,
            options,
        }
    }
}

#[async_trait]
impl Connector for SubprocessConnector {
    async fn connect(&self) -> Result<Transport, SessionError> {
        let (process, stdin, stdout) = ProcessSupervisor::spawn(&self.backend, &self.params)?;
        tracing::info!(
            backend = %self.backend,
            command = %self.params.command,
            pid = ?process.pid(),
            "spawned backend process"
        );
        Ok(Transport::over_pipes(&self.backend, stdin, stdout, &self.options).with_process(process))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
