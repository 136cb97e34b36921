//! Shared plumbing for HTTP-backed providers: error mapping, SSE line
//! framing and dot-path extraction from JSON payloads.

use futures_util::StreamExt;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;

use super::types::TextStream;
use crate::core::errors::RagError;

const STREAM_BUFFER: usize = 32;

pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> RagError {
    if err.is_timeout() {
        RagError::Generation(format!("{} request timed out", provider))
    } else if err.is_connect() {
        RagError::Generation(format!("{} is unreachable: {}", provider, err))
    } else {
        RagError::Generation(format!("{} request failed: {}", provider, err))
    }
}

/// Turns a non-success response into a `GenerationError` with the reason.
pub(crate) async fn ensure_success(provider: &str, res: Response) -> Result<Response, RagError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let body = res.text().await.unwrap_or_default();
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "authentication failed",
        StatusCode::TOO_MANY_REQUESTS => "rate limited",
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => "upstream timeout",
        _ => "request rejected",
    };
    Err(RagError::Generation(format!(
        "{} {} ({}): {}",
        provider,
        reason,
        status.as_u16(),
        truncate(&body, 300)
    )))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Follows a dot path such as `choices.0.message.content`.
pub(crate) fn extract_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| match key.parse::<usize>() {
        Ok(index) if current.is_array() => current.get(index),
        _ => current.get(key.as_str()),
    })
}

pub(crate) fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accumulates raw bytes and yields complete `data:` payloads.
///
/// Network chunks may split an event anywhere, even inside a multibyte
/// character, so bytes are kept until their newline arrives and only whole
/// lines are decoded.
#[derive(Default)]
pub(crate) struct SseBuffer {
    pending: Vec<u8>,
}

pub(crate) enum SseEvent {
    Data(String),
    Done,
}

impl SseBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub(crate) fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.pending);
        parse_line(&String::from_utf8_lossy(&line))
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent::Data(data.to_string()))
}

/// Pumps an SSE response into a [`TextStream`], mapping each JSON payload to
/// an optional text chunk.
///
/// The task returns as soon as the receiver is dropped, which drops the
/// response body and closes the upstream connection.
pub(crate) fn spawn_sse_pump<F>(provider: String, res: Response, extract: F) -> TextStream
where
    F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let mut body = res.bytes_stream();

    tokio::spawn(async move {
        let mut buffer = SseBuffer::default();

        while let Some(item) = body.next().await {
            match item {
                Ok(bytes) => {
                    for event in buffer.push(&bytes) {
                        let chunk = match event {
                            SseEvent::Done => return,
                            SseEvent::Data(data) => decode_chunk(&provider, &extract, &data),
                        };
                        if let Some(chunk) = chunk {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(transport_error(&provider, err))).await;
                    return;
                }
            }
        }

        if let Some(SseEvent::Data(data)) = buffer.finish() {
            if let Some(chunk) = decode_chunk(&provider, &extract, &data) {
                let _ = tx.send(chunk).await;
            }
        }
    });

    rx
}

/// Text carried by one `data:` payload, if any.
fn decode_chunk<F>(provider: &str, extract: &F, data: &str) -> Option<Result<String, RagError>>
where
    F: Fn(&Value) -> Option<String>,
{
    match serde_json::from_str::<Value>(data) {
        Ok(json) => extract(&json).filter(|text| !text.is_empty()).map(Ok),
        Err(err) => {
            tracing::debug!(provider = %provider, "Skipping non-JSON stream line: {}", err);
            None
        }
    }
}
