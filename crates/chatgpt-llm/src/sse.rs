//! Server-sent-event dispatch over a [`ResponseBody`].
//!
//! Every raw chunk is first checked for a JSON error envelope; the service
//! sometimes answers with one in place of an event stream. Anything else goes
//! through the SSE framer and each complete event's `data` is handed to the
//! caller.

use std::io;
use std::ops::ControlFlow;

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{ChatGptError, Result};
use crate::transport::{ResponseBody, TransportResponse};

/// Payload of the final event of a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const INVALID_REQUEST_ERROR: &str = "invalid_request_error";

/// Fail with [`ChatGptError::Http`] unless the status is 2xx.
///
/// The message is the response body, or the reason phrase when the body
/// cannot be read.
pub async fn ensure_success(response: TransportResponse) -> Result<TransportResponse> {
    if response.status.is_success() {
        return Ok(response);
    }

    let status = response.status.as_u16();
    let status_text = response.status_text();
    let message = match response.body.text().await {
        Ok(text) => text,
        Err(err) => {
            log::debug!("Failed to read error body: {}", err);
            status_text.clone()
        }
    };

    Err(ChatGptError::Http {
        status,
        status_text,
        message,
    })
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    detail: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
    code: Option<serde_json::Value>,
}

/// Decode a chunk that is a whole `{"detail":{"type":"invalid_request_error"}}`
/// envelope.
fn service_error_from_chunk(chunk: &[u8]) -> Option<ChatGptError> {
    let envelope: ErrorEnvelope = serde_json::from_slice(chunk).ok()?;
    if envelope.detail.kind.as_deref() != Some(INVALID_REQUEST_ERROR) {
        return None;
    }

    let code = match envelope.detail.code {
        Some(serde_json::Value::String(code)) => code,
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    Some(ChatGptError::Service {
        code,
        message: envelope.detail.message.unwrap_or_default(),
    })
}

#[derive(Debug, Error)]
enum ChunkError {
    #[error(transparent)]
    Service(ChatGptError),
    #[error(transparent)]
    Io(io::Error),
}

/// Map a body read failure, recognising an abruptly closed connection.
fn classify_read_error(err: io::Error) -> ChatGptError {
    let abrupt_kind = matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    );
    let message = err.to_string();
    // Compatibility heuristic: hyper reports a socket closed mid-body only
    // through its message text.
    let lower = message.to_lowercase();
    if abrupt_kind
        || lower == "terminated"
        || lower.contains("connection closed before message completed")
    {
        ChatGptError::Terminated(message)
    } else {
        ChatGptError::Stream(message)
    }
}

/// Drive `body` through the SSE framer until it ends, `on_message` breaks,
/// or `cancel` fires.
///
/// A service error envelope is terminal: it goes to `on_error` (or the log
/// when no handler is given) and never reaches `on_message`. The body is
/// released on every return path.
pub async fn dispatch<M>(
    body: ResponseBody,
    cancel: &CancellationToken,
    mut on_message: M,
    mut on_error: Option<&mut (dyn FnMut(ChatGptError) + Send)>,
) -> Result<()>
where
    M: FnMut(&str) -> Result<ControlFlow<()>>,
{
    let chunks = body.into_chunks()?.map(|chunk| match chunk {
        Ok(bytes) => match service_error_from_chunk(&bytes) {
            Some(err) => Err(ChunkError::Service(err)),
            None => Ok(bytes),
        },
        Err(err) => Err(ChunkError::Io(err)),
    });
    let mut events = Box::pin(chunks.eventsource());

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatGptError::Cancelled),
            next = events.next() => next,
        };

        let Some(event) = next else {
            return Ok(());
        };

        match event {
            Ok(event) => {
                if on_message(&event.data)?.is_break() {
                    return Ok(());
                }
            }
            Err(EventStreamError::Transport(ChunkError::Service(err))) => {
                match on_error.as_mut() {
                    Some(handler) => handler(err),
                    None => log::error!("{}", err),
                }
                return Ok(());
            }
            Err(EventStreamError::Transport(ChunkError::Io(err))) => {
                return Err(classify_read_error(err));
            }
            Err(err) => return Err(ChatGptError::Stream(err.to_string())),
        }
    }
}
