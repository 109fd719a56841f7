//! Direct chat-completions client.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatgpt_core::{
    default_estimator, ChatMessage, CompletionUsage, ContextBuilder, LruMessageStore,
    SharedMessageStore, SharedTokenEstimator, TokenBudget,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::client::{
    persist_turns, with_deadline, ConversationClient, ProgressCallback, SendMessageOptions,
};
use crate::config::{ClientConfig, DEFAULT_API_BASE_URL};
use crate::error::{ChatGptError, Result};
use crate::protocol::is_done;
use crate::protocol::openai::{
    build_chat_request_body, ChatCompletionChunk, ChatCompletionResponse, CompletionParams,
};
use crate::sse::{dispatch, ensure_success};
use crate::transport::{ReqwestTransport, SharedTransport, TransportRequest};

const OPENAI_ORGANIZATION: &str = "openai-organization";

pub fn default_system_message() -> String {
    let current_date = chrono::Local::now().format("%Y-%m-%d");
    format!(
        "You are ChatGPT, a large language model trained by OpenAI. Answer as concisely as possible.\nKnowledge cutoff: 2021-09-01\nCurrent date: {current_date}"
    )
}

/// Client for the official chat-completions endpoint.
///
/// History is kept client-side in the message store and replayed into every
/// request as far as the token budget allows.
pub struct ChatGptApi {
    api_key: String,
    api_org: Option<String>,
    api_base_url: String,
    completion_params: CompletionParams,
    system_message: String,
    budget: TokenBudget,
    store: SharedMessageStore,
    estimator: SharedTokenEstimator,
    transport: SharedTransport,
    timeout: Option<Duration>,
    debug: bool,
}

impl ChatGptApi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_org: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            completion_params: CompletionParams::defaults(),
            system_message: default_system_message(),
            budget: TokenBudget::default(),
            store: Arc::new(LruMessageStore::default()),
            estimator: default_estimator(),
            transport: Arc::new(ReqwestTransport::new()),
            timeout: None,
            debug: false,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ChatGptError::Config("OPENAI_API_KEY is not set".to_string()))?;

        let mut api = Self::new(api_key)
            .with_base_url(config.api_base_url.clone())
            .with_budget(config.budget())
            .with_transport(Arc::new(ReqwestTransport::from_config(config)?))
            .with_debug(config.debug);
        api.api_org = config.api_org.clone();
        api.timeout = config.timeout();
        if let Some(model) = &config.model {
            api.completion_params.model = Some(model.clone());
        }
        if let Some(system_message) = &config.system_message {
            api.system_message = system_message.clone();
        }
        Ok(api)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_org(mut self, org: impl Into<String>) -> Self {
        self.api_org = Some(org.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.completion_params.model = Some(model.into());
        self
    }

    /// Merge `params` over the current defaults.
    pub fn with_completion_params(mut self, params: CompletionParams) -> Self {
        self.completion_params = self.completion_params.merged(&params);
        self
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = system_message.into();
        self
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_message_store(mut self, store: SharedMessageStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_token_estimator(mut self, estimator: SharedTokenEstimator) -> Self {
        self.estimator = estimator;
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

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn set_api_key(&mut self, api_key: impl Into<String>) {
        self.api_key = api_key.into();
    }

    /// Look up a stored turn by id.
    pub async fn get_message(&self, id: &str) -> Result<Option<ChatMessage>> {
        Ok(self.store.get(id).await?)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| ChatGptError::Validation(format!("api key is not a valid header: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        if let Some(org) = &self.api_org {
            let org = HeaderValue::from_str(org).map_err(|e| {
                ChatGptError::Validation(format!("organization is not a valid header: {e}"))
            })?;
            headers.insert(HeaderName::from_static(OPENAI_ORGANIZATION), org);
        }
        Ok(headers)
    }

    async fn exchange(
        &self,
        request: TransportRequest,
        mut result: ChatMessage,
        stream: bool,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<ChatMessage> {
        let signal = request.signal.clone();
        let response = ensure_success(self.transport.send(request).await?).await?;

        if !stream {
            let value: Value = response.json().await?;
            let completion = ChatCompletionResponse::from_value(value.clone())?;
            let message = completion.first_message().ok_or_else(|| {
                ChatGptError::Protocol("OpenAI error: first choice has no message".to_string())
            })?;
            result.text = message.content.clone().unwrap_or_default();
            if let Some(role) = message.role {
                result.role = role;
            }
            if let Some(id) = completion.id {
                result.id = id;
            }
            result.usage = completion.usage;
            result.detail = Some(value);
            return Ok(result);
        }

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
                    result.text = result.text.trim().to_string();
                    done = true;
                    return Ok(ControlFlow::Break(()));
                }

                let value: Value = serde_json::from_str(data).map_err(|e| {
                    log::warn!("OpenAI stream event unexpected error: {}", e);
                    e
                })?;
                let chunk = ChatCompletionChunk::deserialize(&value)?;
                if let Some(id) = chunk.id.as_ref() {
                    result.id = id.clone();
                }
                if let Some(delta) = chunk.first_delta() {
                    result.delta = delta.content.clone();
                    if let Some(content) = &delta.content {
                        result.text.push_str(content);
                    }
                    if let Some(role) = delta.role {
                        result.role = role;
                    }
                    result.detail = Some(value);
                    if let Some(on_progress) = on_progress {
                        on_progress(&result);
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
        Ok(result)
    }
}

#[async_trait]
impl ConversationClient for ChatGptApi {
    async fn send_message(&self, text: &str, options: SendMessageOptions) -> Result<ChatMessage> {
        if self.api_key.is_empty() {
            return Err(ChatGptError::Validation(
                "OpenAI missing required apiKey".to_string(),
            ));
        }

        let stream = options.is_streaming();
        let timeout = options.timeout.or(self.timeout);
        let (signal, owns_signal) = options.signal();

        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut question = ChatMessage::user(text).with_id(message_id.clone());
        question.parent_message_id = options.parent_message_id.clone();
        question.conversation_id = options.conversation_id.clone();
        question.name = options.name.clone();

        let system_message = options
            .system_message
            .as_deref()
            .unwrap_or(&self.system_message);
        let builder = ContextBuilder::new(self.store.clone(), self.estimator.clone(), self.budget);
        let prompt = builder
            .build(
                text,
                options.name.as_deref(),
                options.parent_message_id.as_deref(),
                Some(system_message),
            )
            .await;

        let mut answer = ChatMessage::assistant("").with_parent(message_id);
        answer.conversation_id = options.conversation_id.clone();

        let params = match &options.completion_params {
            Some(overrides) => self.completion_params.merged(overrides),
            None => self.completion_params.clone(),
        };
        let body =
            build_chat_request_body(&params, &prompt.messages, prompt.max_response_tokens, stream)?;
        if self.debug {
            log::debug!("sendMessage ({} tokens) {}", prompt.prompt_tokens, body);
        }

        let request = TransportRequest {
            method: Method::POST,
            url: format!("{}/chat/completions", self.api_base_url),
            headers: self.headers()?,
            body,
            signal: signal.clone(),
        };

        let exchange = self.exchange(request, answer, stream, options.on_progress.as_ref());
        let mut answer = with_deadline(exchange, &signal, owns_signal, timeout).await?;

        if answer.usage.is_none() {
            let completion_tokens = self.estimator.estimate(&answer.text);
            answer.usage = Some(CompletionUsage {
                prompt_tokens: prompt.prompt_tokens,
                completion_tokens,
                total_tokens: prompt.prompt_tokens + completion_tokens,
                estimated: true,
            });
        }

        persist_turns(self.store.as_ref(), &question, &answer).await;
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_system_message_carries_current_date() {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        let message = default_system_message();

        assert!(message.starts_with("You are ChatGPT"));
        assert!(message.ends_with(&format!("Current date: {today}")));
    }

    #[test]
    fn headers_include_bearer_and_organization() {
        let api = ChatGptApi::new("sk-test").with_org("org-1");

        let headers = api.headers().unwrap();

        assert_eq!(headers[AUTHORIZATION], "Bearer sk-test");
        assert_eq!(headers["openai-organization"], "org-1");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let api = ChatGptApi::new("sk").with_base_url("http://localhost:8080/v1/");
        assert_eq!(api.api_base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn from_config_requires_api_key() {
        let result = ChatGptApi::from_config(&ClientConfig::default());
        assert!(matches!(result, Err(ChatGptError::Config(_))));
    }

    #[test]
    fn from_config_applies_model_and_budget() {
        let config = ClientConfig {
            api_key: Some("sk".to_string()),
            model: Some("gpt-4".to_string()),
            max_model_tokens: 8000,
            system_message: Some("be terse".to_string()),
            timeout_ms: Some(250),
            ..ClientConfig::default()
        };

        let api = ChatGptApi::from_config(&config).unwrap();

        assert_eq!(api.completion_params.model.as_deref(), Some("gpt-4"));
        assert_eq!(api.budget.max_model_tokens, 8000);
        assert_eq!(api.system_message, "be terse");
        assert_eq!(api.timeout, Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn empty_api_key_is_rejected_before_any_request() {
        let mut api = ChatGptApi::new("sk");
        api.set_api_key("");

        let err = api
            .send_message("hi", SendMessageOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ChatGptError::Validation(_)));
    }
}
