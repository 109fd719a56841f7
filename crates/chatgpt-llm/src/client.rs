//! The conversation capability shared by both clients.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatgpt_core::{ChatMessage, MessageStore};
use tokio_util::sync::CancellationToken;

use crate::error::{ChatGptError, Result};
use crate::protocol::openai::CompletionParams;

/// Called with the partial result after every streamed update.
pub type ProgressCallback = Arc<dyn Fn(&ChatMessage) + Send + Sync>;

/// Per-call options for [`ConversationClient::send_message`].
#[derive(Clone, Default)]
pub struct SendMessageOptions {
    pub conversation_id: Option<String>,
    pub parent_message_id: Option<String>,
    /// Id of the new user turn; a fresh v4 UUID when unset.
    pub message_id: Option<String>,
    pub name: Option<String>,
    pub system_message: Option<String>,
    /// Defaults to streaming exactly when `on_progress` is set.
    pub stream: Option<bool>,
    pub timeout: Option<Duration>,
    pub abort_signal: Option<CancellationToken>,
    pub on_progress: Option<ProgressCallback>,
    pub completion_params: Option<CompletionParams>,
}

impl SendMessageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_parent_message_id(mut self, parent_message_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_message_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_abort_signal(mut self, signal: CancellationToken) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    pub fn with_progress<F>(mut self, on_progress: F) -> Self
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    pub fn with_completion_params(mut self, params: CompletionParams) -> Self {
        self.completion_params = Some(params);
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(self.on_progress.is_some())
    }

    /// The caller's signal, or a fresh one owned by this call.
    pub(crate) fn signal(&self) -> (CancellationToken, bool) {
        match &self.abort_signal {
            Some(signal) => (signal.clone(), false),
            None => (CancellationToken::new(), true),
        }
    }
}

impl fmt::Debug for SendMessageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendMessageOptions")
            .field("conversation_id", &self.conversation_id)
            .field("parent_message_id", &self.parent_message_id)
            .field("message_id", &self.message_id)
            .field("name", &self.name)
            .field("system_message", &self.system_message)
            .field("stream", &self.stream)
            .field("timeout", &self.timeout)
            .field("abort_signal", &self.abort_signal.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("completion_params", &self.completion_params)
            .finish()
    }
}

#[async_trait]
pub trait ConversationClient: Send + Sync {
    /// Send `text` as the next user turn and resolve with the assistant turn.
    async fn send_message(&self, text: &str, options: SendMessageOptions) -> Result<ChatMessage>;
}

/// Run `future` until it finishes, `signal` fires, or `timeout` elapses.
///
/// On timeout an owned signal is cancelled so that anything else watching it
/// stops too; a caller's signal is left alone.
pub(crate) async fn with_deadline<F, T>(
    future: F,
    signal: &CancellationToken,
    owns_signal: bool,
    timeout: Option<Duration>,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let deadline = async move {
        match timeout {
            Some(duration) => {
                tokio::time::sleep(duration).await;
                duration
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = signal.cancelled() => Err(ChatGptError::Cancelled),
        elapsed = deadline => {
            if owns_signal {
                signal.cancel();
            }
            Err(ChatGptError::Timeout(elapsed))
        }
        result = future => result,
    }
}

/// Upsert question then answer. Failures are logged, never returned.
pub(crate) async fn persist_turns(store: &dyn MessageStore, question: &ChatMessage, answer: &ChatMessage) {
    for message in [question, answer] {
        if let Err(err) = store.set(&message.id, message.clone()).await {
            log::warn!("Failed to store message {}: {}", message.id, err);
        }
    }
}
