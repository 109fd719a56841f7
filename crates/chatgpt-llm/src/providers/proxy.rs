//! Reverse-proxy client for the browser conversation backend.
//!
//! The backend keeps history server-side, so no context is assembled here;
//! a conversation is continued by passing back the `conversation_id` and the
//! id of the last answer.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatgpt_core::{ChatMessage, SharedMessageStore};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use uuid::{Uuid, Variant, Version};

use crate::client::{
    persist_turns, with_deadline, ConversationClient, ProgressCallback, SendMessageOptions,
};
use crate::config::ClientConfig;
use crate::error::{ChatGptError, Result};
use crate::protocol::is_done;
use crate::protocol::proxy::{ConversationRequest, ConversationResponseEvent, DEFAULT_PROXY_MODEL};
use crate::sse::{dispatch, ensure_success};
use crate::transport::{ReqwestTransport, SharedTransport, TransportRequest};

pub const DEFAULT_REVERSE_PROXY_URL: &str = "https://chat.openai.com/backend-api/conversation";

/// Whether `id` is a hyphenated version-4 UUID.
pub fn is_valid_uuid_v4(id: &str) -> bool {
    if id.len() != 36 {
        return false;
    }
    match Uuid::parse_str(id) {
        Ok(uuid) => {
            uuid.get_version() == Some(Version::Random) && uuid.get_variant() == Variant::RFC4122
        }
        Err(_) => false,
    }
}

fn validate_ids(options: &SendMessageOptions) -> Result<()> {
    if options.conversation_id.is_some() != options.parent_message_id.is_some() {
        return Err(ChatGptError::Validation(
            "conversation_id and parent_message_id must both be set or both be unset".to_string(),
        ));
    }

    let ids = [
        ("conversation_id", &options.conversation_id),
        ("parent_message_id", &options.parent_message_id),
        ("message_id", &options.message_id),
    ];
    for (field, id) in ids {
        if let Some(id) = id {
            if !is_valid_uuid_v4(id) {
                return Err(ChatGptError::Validation(format!(
                    "{field} is not a valid v4 UUID: {id}"
                )));
            }
        }
    }
    Ok(())
}

pub struct ChatGptUnofficialProxyApi {
    access_token: String,
    api_reverse_proxy_url: String,
    model: String,
    headers: HeaderMap,
    store: Option<SharedMessageStore>,
    transport: SharedTransport,
    timeout: Option<Duration>,
    debug: bool,
}

impl ChatGptUnofficialProxyApi {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            api_reverse_proxy_url: DEFAULT_REVERSE_PROXY_URL.to_string(),
            model: DEFAULT_PROXY_MODEL.to_string(),
            headers: HeaderMap::new(),
            store: None,
            transport: Arc::new(ReqwestTransport::new()),
            timeout: None,
            debug: false,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let access_token = config
            .access_token
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ChatGptError::Config("CHATGPT_ACCESS_TOKEN is not set".to_string()))?;

        let mut api = Self::new(access_token)
            .with_transport(Arc::new(ReqwestTransport::from_config(config)?))
            .with_debug(config.debug);
        if let Some(url) = &config.api_reverse_proxy_url {
            api.api_reverse_proxy_url = url.clone();
        }
        if let Some(model) = &config.model {
            api.model = model.clone();
        }
        api.timeout = config.timeout();
        Ok(api)
    }

    pub fn with_reverse_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.api_reverse_proxy_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Extra headers sent with every request.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Persist question and answer turns in `store`.
    pub fn with_message_store(mut self, store: SharedMessageStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: SharedTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn set_access_token(&mut self, access_token: impl Into<String>) {
        self.access_token = access_token.into();
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.access_token)).map_err(|e| {
            ChatGptError::Validation(format!("access token is not a valid header: {e}"))
        })?;
        headers.insert(AUTHORIZATION, bearer);
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        Ok(headers)
    }

    async fn exchange(
        &self,
        request: TransportRequest,
        result: &mut ChatMessage,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        let signal = request.signal.clone();
        let response = ensure_success(self.transport.send(request).await?).await?;

        let mut done = false;
        let mut service_error: Option<ChatGptError> = None;
        let mut on_error = |err: ChatGptError| {
            service_error.get_or_insert(err);
        };

        dispatch(
            response.body,
            &signal,
            |data| {
                if is_done(data) {
                    done = true;
                    return Ok(ControlFlow::Break(()));
                }

                let event: ConversationResponseEvent = match serde_json::from_str(data) {
                    Ok(event) => event,
                    Err(err) => {
                        log::debug!("Ignoring unexpected conversation frame: {}", err);
                        return Ok(ControlFlow::Continue(()));
                    }
                };
                if let Some(conversation_id) = &event.conversation_id {
                    result.conversation_id = Some(conversation_id.clone());
                }
                if let Some(id) = event.message_id() {
                    result.id = id.to_string();
                }
                if let Some(text) = event.text() {
                    result.text = text.to_string();
                    if let Some(on_progress) = on_progress {
                        on_progress(result);
                    }
                }
                Ok(ControlFlow::Continue(()))
            },
            Some(&mut on_error),
        )
        .await?;

        if let Some(err) = service_error {
            return Err(err);
        }
        if !done {
            return Err(ChatGptError::Protocol(
                "stream ended before [DONE]".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationClient for ChatGptUnofficialProxyApi {
    async fn send_message(&self, text: &str, options: SendMessageOptions) -> Result<ChatMessage> {
        validate_ids(&options)?;

        let timeout = options.timeout.or(self.timeout);
        let (signal, owns_signal) = options.signal();

        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let parent_message_id = options
            .parent_message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let body = ConversationRequest::next(
            message_id.clone(),
            text,
            self.model.clone(),
            parent_message_id.clone(),
            options.conversation_id.clone(),
        );
        let body = serde_json::to_value(&body)?;
        if self.debug {
            log::debug!("sendMessage {}", body);
        }

        let request = TransportRequest {
            method: Method::POST,
            url: self.api_reverse_proxy_url.clone(),
            headers: self.headers()?,
            body,
            signal: signal.clone(),
        };

        let mut answer = ChatMessage::assistant("").with_parent(message_id.clone());
        answer.conversation_id = options.conversation_id.clone();

        let exchange = self.exchange(request, &mut answer, options.on_progress.as_ref());
        let outcome = with_deadline(exchange, &signal, owns_signal, timeout).await;
        match outcome {
            Ok(()) => {}
            Err(err) if err.is_terminated() && !answer.text.is_empty() => {
                log::warn!("Conversation stream closed early, returning partial answer: {}", err);
            }
            Err(err) => return Err(err),
        }
        answer.text = answer.text.trim().to_string();

        if let Some(store) = &self.store {
            let mut question = ChatMessage::user(text)
                .with_id(message_id)
                .with_parent(parent_message_id);
            question.conversation_id = answer.conversation_id.clone();
            question.name = options.name.clone();
            persist_turns(store.as_ref(), &question, &answer).await;
        }

        Ok(answer)
    }
}
