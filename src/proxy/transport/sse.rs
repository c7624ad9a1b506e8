//! Remote-stream transport: server-sent events in, HTTP POST out.
//!
//! The backend streams `event:`/`data:` blocks over a long-lived GET. The
//! first `endpoint` event names the URL that requests are POSTed to; every
//! later `message` event carries one JSON-RPC message. The two directions
//! are separate HTTP exchanges, joined only by request id.

use std::fmt::Display;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;

use super::{Outbound, Transport, TransportOptions};
use crate::proxy::config::StreamParams;
use crate::proxy::errors::{SessionError, TransportError, TransportErrorKind};
use crate::proxy::session::Connector;

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the block names none.
    pub event: String,
    pub data: String,
}

/// Decode one event block (the text between blank lines).
///
/// Comment lines (`:`), `id:` and `retry:` are ignored. Returns `None` for
/// blocks with no data, such as keep-alives.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

/// Turn a raw HTTP body into a stream of events.
pub fn sse_events<S, B, E>(backend: &str, bytes: S) -> BoxStream<'static, Result<SseEvent, TransportError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let backend = backend.to_string();
    let byte_stream = Box::pin(bytes);

    Box::pin(stream::unfold(
        (byte_stream, backend, Vec::<u8>::new()),
        |(mut byte_stream, backend, mut buffer)| async move {
            loop {
                // Decode only complete blocks so a character split across
                // chunks is reassembled first.
                if let Some(event_end) = find_block_end(&buffer) {
                    let block: Vec<u8> = buffer.drain(..event_end + 2).collect();
                    let block = String::from_utf8_lossy(&block[..event_end]);

                    match parse_event(&block) {
                        Some(event) => return Some((Ok(event), (byte_stream, backend, buffer))),
                        None => continue,
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend_from_slice(bytes.as_ref());
                        if buffer.contains(&b'\r') {
                            normalize_line_endings(&mut buffer);
                        }
                    }
                    Some(Err(e)) => {
                        let err = TransportError::new(
                            &backend,
                            TransportErrorKind::ReadFailed,
                            format!("stream read error: {e}"),
                        );
                        return Some((Err(err), (byte_stream, backend, Vec::new())));
                    }
                    None => {
                        // Flush a final block that lacked its blank line.
                        let tail = std::mem::take(&mut buffer);
                        let tail = String::from_utf8_lossy(&tail);
                        return parse_event(tail.trim_end())
                            .map(|event| (Ok(event), (byte_stream, backend, buffer)));
                    }
                }
            }
        },
    ))
}

/// Offset of the blank line terminating the first complete block.
fn find_block_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Rewrite `\r\n` as `\n` in place. A trailing lone `\r` is kept so its
/// `\n` can join it from the next chunk.
fn normalize_line_endings(buffer: &mut Vec<u8>) {
    let mut out = Vec::with_capacity(buffer.len());
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i] == b'\r' && buffer.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(buffer[i]);
        i += 1;
    }
    *buffer = out;
}

/// Resolve the `endpoint` event's data against the stream URL.
fn resolve_endpoint(
    backend: &str,
    base: &reqwest::Url,
    data: &str,
) -> Result<reqwest::Url, TransportError> {
    base.join(data.trim()).map_err(|e| {
        TransportError::new(
            backend,
            TransportErrorKind::ConnectFailed,
            format!("invalid endpoint '{}': {e}", data.trim()),
        )
    })
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Opens a transport by subscribing to a remote event stream.
pub struct StreamConnector {
    backend: String,
    params: StreamParams,
    options: TransportOptions,
    client: reqwest::Client,
}

impl StreamConnector {
    pub fn new(backend: &str, params: StreamParams, options: TransportOptions) -> Self {
        Self {
            backend: backend.to_string(),
            params,
            options,
            client: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn open(&self) -> Result<Transport, TransportError> {
        let connect_failed =
            |reason: String| TransportError::new(&self.backend, TransportErrorKind::ConnectFailed, reason);

        let mut request = self
            .client
            .get(&self.params.url)
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = self.params.credential() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| connect_failed(format!("GET {} failed: {e}", self.params.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(connect_failed(format!("GET {} returned {status}", self.params.url)));
        }

        let base = response.url().clone();
        let mut events = sse_events(&self.backend, response.bytes_stream());

        let endpoint = loop {
            match events.next().await {
                Some(Ok(event)) if event.event == "endpoint" => {
                    break resolve_endpoint(&self.backend, &base, &event.data)?;
                }
                Some(Ok(event)) => {
                    tracing::debug!(backend = %self.backend, event = %event.event, "event before endpoint ignored");
                }
                Some(Err(e)) => return Err(e),
                None => return Err(connect_failed("stream ended before endpoint event".into())),
            }
        };
        tracing::debug!(backend = %self.backend, endpoint = %endpoint, "stream endpoint announced");

        let backend = self.backend.clone();
        let frames = events
            .filter_map(move |event| {
                let frame = match event {
                    Ok(event) if event.event == "message" => Some(Ok(event.data)),
                    Ok(event) => {
                        tracing::debug!(backend = %backend, event = %event.event, "ignoring stream event");
                        None
                    }
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(frame)
            })
            .boxed();

        let outbound = Outbound::Post {
            client: self.client.clone(),
            endpoint,
            credential: self.params.credential().map(str::to_string),
        };
        Ok(Transport::new(&self.backend, outbound, frames, &self.options))
    }
}

#[async_trait]
impl Connector for StreamConnector {
    async fn connect(&self) -> Result<Transport, SessionError> {
        let timeout = self.options.connect_timeout;
        let transport = tokio::time::timeout(timeout, self.open())
            .await
            .map_err(|_| {
                TransportError::new(
                    &self.backend,
                    TransportErrorKind::ConnectFailed,
                    format!("no endpoint event within {}ms", timeout.as_millis()),
                )
            })??;
        tracing::info!(backend = %self.backend, url = %self.params.url, "connected to backend stream");
        Ok(transport)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
