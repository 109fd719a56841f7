use std::time::Duration;

use chatgpt_core::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatGptError {
    /// Non-2xx response, raised before any body parsing.
    #[error("ChatGPT error {status}: {message}")]
    Http {
        status: u16,
        status_text: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Transport(String),

    #[error("Stream error: {0}")]
    Stream(String),

    /// The connection was closed while the response body was still being read.
    #[error("Stream terminated: {0}")]
    Terminated(String),

    /// Error envelope sent by the service inside an otherwise successful response.
    #[error("ChatGPT error {message}: {code} (invalid_request_error)")]
    Service { code: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ChatGPT timed out waiting for response after {0:?}")]
    Timeout(Duration),

    #[error("Request aborted")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ChatGptError>;

impl ChatGptError {
    /// HTTP status, or the code carried by a service error envelope.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ChatGptError::Http { status, .. } => Some(*status),
            ChatGptError::Service { code, .. } => code.parse().ok(),
            _ => None,
        }
    }

    /// HTTP reason phrase, or the message of a service error envelope.
    pub fn status_text(&self) -> Option<&str> {
        match self {
            ChatGptError::Http { status_text, .. } => Some(status_text),
            ChatGptError::Service { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ChatGptError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatGptError::Cancelled)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, ChatGptError::Terminated(_))
    }
}

impl From<reqwest::Error> for ChatGptError {
    fn from(err: reqwest::Error) -> Self {
        ChatGptError::Transport(error_chain(&err))
    }
}

/// Render an error together with its `source()` chain.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
