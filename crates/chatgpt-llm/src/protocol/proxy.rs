//! Reverse-proxy conversation shapes.

use chatgpt_core::Role;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROXY_MODEL: &str = "text-davinci-002-render-sha";

const ACTION_NEXT: &str = "next";
const CONTENT_TYPE_TEXT: &str = "text";

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRequest {
    pub action: String,
    pub messages: Vec<ConversationMessage>,
    pub model: String,
    pub parent_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub id: String,
    pub author: Author,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize)]
pub struct Author {
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub content_type: String,
    pub parts: Vec<String>,
}

impl ConversationRequest {
    /// A `next` action carrying one user message.
    pub fn next(
        message_id: impl Into<String>,
        text: impl Into<String>,
        model: impl Into<String>,
        parent_message_id: impl Into<String>,
        conversation_id: Option<String>,
    ) -> Self {
        Self {
            action: ACTION_NEXT.to_string(),
            messages: vec![ConversationMessage {
                id: message_id.into(),
                author: Author { role: Role::User },
                content: MessageContent {
                    content_type: CONTENT_TYPE_TEXT.to_string(),
                    parts: vec![text.into()],
                },
            }],
            model: model.into(),
            parent_message_id: parent_message_id.into(),
            conversation_id,
        }
    }
}

/// One streamed frame. Each frame carries the full answer so far.
#[derive(Debug, Default, Deserialize)]
pub struct ConversationResponseEvent {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: Option<ResponseMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<ResponseContent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseContent {
    #[serde(default)]
    pub parts: Vec<String>,
}

impl ConversationResponseEvent {
    /// Text of the first part, when non-empty.
    pub fn text(&self) -> Option<&str> {
        self.message
            .as_ref()?
            .content
            .as_ref()?
            .parts
            .first()
            .map(String::as_str)
            .filter(|text| !text.is_empty())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message.as_ref()?.id.as_deref()
    }
}
