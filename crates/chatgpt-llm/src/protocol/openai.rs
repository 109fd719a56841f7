//! Chat-completions request and response shapes.

use chatgpt_core::{CompletionUsage, PromptMessage, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatGptError, Result};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Sampling parameters sent with every completion request.
///
/// Unset fields are left out of the body so the service applies its own
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl CompletionParams {
    pub fn defaults() -> Self {
        Self {
            model: Some(DEFAULT_MODEL.to_string()),
            temperature: Some(0.8),
            top_p: Some(1.0),
            presence_penalty: Some(1.0),
            ..Self::default()
        }
    }

    /// Field-wise merge; values set in `overrides` win.
    pub fn merged(&self, overrides: &CompletionParams) -> CompletionParams {
        CompletionParams {
            model: overrides.model.clone().or_else(|| self.model.clone()),
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            presence_penalty: overrides.presence_penalty.or(self.presence_penalty),
            frequency_penalty: overrides.frequency_penalty.or(self.frequency_penalty),
            stop: overrides.stop.clone().or_else(|| self.stop.clone()),
            user: overrides.user.clone().or_else(|| self.user.clone()),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    #[serde(flatten)]
    params: &'a CompletionParams,
    max_tokens: u32,
    messages: &'a [PromptMessage],
    stream: bool,
}

/// Build the JSON body for `POST {base}/chat/completions`.
pub fn build_chat_request_body(
    params: &CompletionParams,
    messages: &[PromptMessage],
    max_tokens: u32,
    stream: bool,
) -> Result<Value> {
    Ok(serde_json::to_value(ChatRequest {
        params,
        max_tokens,
        messages,
        stream,
    })?)
}

// --- Non-streaming response ---

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    pub usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseChoice {
    pub message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    pub role: Option<Role>,
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    /// Decode a completion body, rejecting one without choices.
    pub fn from_value(value: Value) -> Result<Self> {
        let has_choices = value
            .get("choices")
            .and_then(Value::as_array)
            .is_some_and(|choices| !choices.is_empty());
        if !has_choices {
            return Err(ChatGptError::Protocol(format!(
                "OpenAI error: {}",
                describe_missing_choices(&value)
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn first_message(&self) -> Option<&ResponseMessage> {
        self.choices.first().and_then(|choice| choice.message.as_ref())
    }
}

/// Best diagnostic available in a body that has no choices.
pub fn describe_missing_choices(value: &Value) -> String {
    let detail = value.get("detail");
    if let Some(message) = detail
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
    {
        return message.to_string();
    }
    match detail {
        Some(Value::String(text)) if !text.is_empty() => text.clone(),
        Some(Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string(),
    }
}

// --- Streaming chunks ---

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    pub fn first_delta(&self) -> Option<&ChunkDelta> {
        self.choices.first().map(|choice| &choice.delta)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_body_flattens_params_and_skips_unset() {
        let messages = vec![
            PromptMessage::new(Role::System, "sys"),
            PromptMessage::new(Role::User, "Hello"),
        ];

        let body =
            build_chat_request_body(&CompletionParams::defaults(), &messages, 1000, true).unwrap();

        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["temperature"], json!(0.8));
        assert_eq!(body["top_p"], json!(1.0));
        assert_eq!(body["presence_penalty"], json!(1.0));
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "Hello"}));
        assert!(body.get("frequency_penalty").is_none());
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn overrides_win_field_by_field() {
        let overrides = CompletionParams {
            model: Some("gpt-4".to_string()),
            temperature: Some(0.1),
            ..CompletionParams::default()
        };

        let merged = CompletionParams::defaults().merged(&overrides);

        assert_eq!(merged.model.as_deref(), Some("gpt-4"));
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.top_p, Some(1.0));
        assert_eq!(merged.presence_penalty, Some(1.0));
    }

    #[test]
    fn response_reads_first_choice_and_usage() {
        let response = ChatCompletionResponse::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .unwrap();

        let message = response.first_message().unwrap();
        assert_eq!(message.role, Some(Role::Assistant));
        assert_eq!(message.content.as_deref(), Some("Hi there"));
        let usage = response.usage.unwrap();
        assert_eq!(usage.total_tokens, 15);
        assert!(!usage.estimated);
    }

    #[test]
    fn missing_choices_reports_detail() {
        let err = ChatCompletionResponse::from_value(json!({
            "detail": {"message": "model overloaded"}
        }))
        .unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: OpenAI error: model overloaded");

        let err = ChatCompletionResponse::from_value(json!({"choices": []})).unwrap_err();
        assert!(err.to_string().ends_with("unknown"));
    }

    #[test]
    fn describe_missing_choices_falls_back_in_order() {
        assert_eq!(
            describe_missing_choices(&json!({"detail": {"message": "m"}})),
            "m"
        );
        assert_eq!(describe_missing_choices(&json!({"detail": "plain"})), "plain");
        assert_eq!(
            describe_missing_choices(&json!({"detail": {"code": 1}})),
            r#"{"code":1}"#
        );
        assert_eq!(describe_missing_choices(&json!({})), "unknown");
    }

    #[test]
    fn chunk_delta_fields_are_optional() {
        let chunk: ChatCompletionChunk =
            serde_json::from_str(r#"{"id":"c1","choices":[{"delta":{}}]}"#).unwrap();
        let delta = chunk.first_delta().unwrap();
        assert!(delta.role.is_none());
        assert!(delta.content.is_none());

        let chunk: ChatCompletionChunk = serde_json::from_str(r#"{"id":"c1"}"#).unwrap();
        assert!(chunk.first_delta().is_none());
    }
}
