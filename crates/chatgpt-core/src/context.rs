//! Conversation context assembly under a token budget.
//!
//! History is reconstructed by following `parent_message_id` links through
//! the [`MessageStore`] one lookup at a time. Ancestors are added whole, newest
//! first, until the next one would push the rendered prompt past the budget.

use serde::{Deserialize, Serialize};

use crate::message::Role;
use crate::store::SharedMessageStore;
use crate::tokens::SharedTokenEstimator;

pub const SYSTEM_LABEL: &str = "Instructions";
pub const USER_LABEL: &str = "User";
pub const ASSISTANT_LABEL: &str = "ChatGPT";

pub const DEFAULT_MAX_MODEL_TOKENS: u32 = 4000;
pub const DEFAULT_MAX_RESPONSE_TOKENS: u32 = 1000;

/// Context window split between prompt and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Maximum context window size for the model (prompt + response)
    pub max_model_tokens: u32,
    /// Maximum tokens requested for the response
    pub max_response_tokens: u32,
}

impl TokenBudget {
    pub fn new(max_model_tokens: u32, max_response_tokens: u32) -> Self {
        Self {
            max_model_tokens,
            max_response_tokens,
        }
    }

    /// Tokens left for the prompt once the response reserve is taken out.
    pub fn max_prompt_tokens(&self) -> u32 {
        self.max_model_tokens
            .saturating_sub(self.max_response_tokens)
    }

    /// Response ceiling for a prompt of the given size, never below 1.
    pub fn response_tokens_for(&self, prompt_tokens: u32) -> u32 {
        self.max_model_tokens
            .saturating_sub(prompt_tokens)
            .min(self.max_response_tokens)
            .max(1)
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MODEL_TOKENS, DEFAULT_MAX_RESPONSE_TOKENS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    fn label(&self) -> &'static str {
        match self.role {
            Role::System => SYSTEM_LABEL,
            Role::User => USER_LABEL,
            Role::Assistant => ASSISTANT_LABEL,
        }
    }
}

/// Prompt ready to be sent, with the token numbers it was negotiated under.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptAssembly {
    pub messages: Vec<PromptMessage>,
    pub prompt_tokens: u32,
    pub max_response_tokens: u32,
}

/// Flatten messages into the role-prefixed text used for estimation.
pub fn render_prompt(messages: &[PromptMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}:\n{}", m.label(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Clone)]
pub struct ContextBuilder {
    store: SharedMessageStore,
    estimator: SharedTokenEstimator,
    budget: TokenBudget,
}

impl ContextBuilder {
    pub fn new(
        store: SharedMessageStore,
        estimator: SharedTokenEstimator,
        budget: TokenBudget,
    ) -> Self {
        Self {
            store,
            estimator,
            budget,
        }
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    /// Assemble the longest history that fits the prompt budget.
    ///
    /// The result is ordered system message, ancestors oldest to newest, then
    /// the new user turn. An ancestor that cannot be resolved ends the walk
    /// without an error.
    pub async fn build(
        &self,
        latest_text: &str,
        name: Option<&str>,
        parent_message_id: Option<&str>,
        system_message: Option<&str>,
    ) -> PromptAssembly {
        let max_prompt_tokens = self.budget.max_prompt_tokens();

        let mut accepted: Vec<PromptMessage> = Vec::new();
        if let Some(system) = system_message.filter(|s| !s.is_empty()) {
            accepted.push(PromptMessage::new(Role::System, system));
        }
        let system_offset = accepted.len();
        let mut prompt_tokens = if accepted.is_empty() {
            0
        } else {
            self.estimator.estimate(&render_prompt(&accepted))
        };

        let mut candidate = accepted.clone();
        if !latest_text.is_empty() {
            candidate.push(PromptMessage {
                role: Role::User,
                content: latest_text.to_string(),
                name: name.map(str::to_string),
            });
        }

        let mut parent_id = parent_message_id.map(str::to_string);
        loop {
            let prompt = render_prompt(&candidate);
            let tokens = self.estimator.estimate(&prompt);
            if !prompt.is_empty() && tokens > max_prompt_tokens {
                log::debug!(
                    "Prompt of {} tokens exceeds budget of {}; keeping {} messages",
                    tokens,
                    max_prompt_tokens,
                    accepted.len()
                );
                break;
            }

            accepted = candidate;
            prompt_tokens = tokens;

            let Some(id) = parent_id.take() else {
                break;
            };
            let parent = match self.store.get(&id).await {
                Ok(Some(parent)) => parent,
                Ok(None) => {
                    log::debug!("Parent message {} not found; history truncated", id);
                    break;
                }
                Err(err) => {
                    log::warn!("Failed to load parent message {}: {}", id, err);
                    break;
                }
            };

            candidate = accepted.clone();
            candidate.insert(
                system_offset,
                PromptMessage {
                    role: parent.role,
                    content: parent.text,
                    name: parent.name,
                },
            );
            parent_id = parent.parent_message_id;
        }

        PromptAssembly {
            messages: accepted,
            prompt_tokens,
            max_response_tokens: self.budget.response_tokens_for(prompt_tokens),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreError;
    use crate::message::ChatMessage;
    use crate::store::{LruMessageStore, MessageStore};
    use crate::tokens::{HeuristicTokenEstimator, TokenEstimator};

    /// One token per character, so budgets can be computed by hand.
    fn char_estimator() -> SharedTokenEstimator {
        Arc::new(HeuristicTokenEstimator::new(1.0, 1.0))
    }

    fn builder(store: Arc<LruMessageStore>, budget: TokenBudget) -> ContextBuilder {
        ContextBuilder::new(store, char_estimator(), budget)
    }

    /// Store a chain of `len` turns; returns the id of the newest one.
    async fn seed_chain(store: &LruMessageStore, len: usize, text_len: usize) -> String {
        let mut parent: Option<String> = None;
        let mut last = String::new();
        for i in 0..len {
            let text = format!("{:0>width$}", i, width = text_len);
            let mut message = ChatMessage::user(text).with_id(format!("m{i}"));
            message.parent_message_id = parent.clone();
            store.set(&message.id, message.clone()).await.unwrap();
            parent = Some(message.id.clone());
            last = message.id;
        }
        last
    }

    #[test]
    fn render_prompt_uses_role_labels() {
        let messages = vec![
            PromptMessage::new(Role::System, "be brief"),
            PromptMessage::new(Role::User, "hi"),
            PromptMessage::new(Role::Assistant, "hello"),
        ];

        assert_eq!(
            render_prompt(&messages),
            "Instructions:\nbe brief\n\nUser:\nhi\n\nChatGPT:\nhello"
        );
    }

    #[test]
    fn response_tokens_are_clamped() {
        let budget = TokenBudget::new(4000, 1000);
        assert_eq!(budget.response_tokens_for(10), 1000);
        assert_eq!(budget.response_tokens_for(3500), 500);
        assert_eq!(budget.response_tokens_for(4000), 1);
        assert_eq!(budget.response_tokens_for(9000), 1);
    }

    #[tokio::test]
    async fn first_message_yields_system_and_user() {
        let store = Arc::new(LruMessageStore::default());
        let builder = builder(store, TokenBudget::new(4000, 1000));

        let prompt = builder
            .build("Hello", None, None, Some("You are helpful"))
            .await;

        assert_eq!(prompt.messages.len(), 2);
        assert_eq!(prompt.messages[0].role, Role::System);
        assert_eq!(prompt.messages[1].role, Role::User);
        assert_eq!(prompt.messages[1].content, "Hello");
        assert_eq!(
            prompt.prompt_tokens,
            "Instructions:\nYou are helpful\n\nUser:\nHello".len() as u32
        );
        assert_eq!(prompt.max_response_tokens, 1000);
    }

    #[tokio::test]
    async fn empty_text_without_system_message_is_empty() {
        let store = Arc::new(LruMessageStore::default());
        let builder = builder(store, TokenBudget::new(4000, 1000));

        let prompt = builder.build("", None, None, None).await;

        assert!(prompt.messages.is_empty());
        assert_eq!(prompt.prompt_tokens, 0);
        assert_eq!(prompt.max_response_tokens, 1000);
    }

    #[tokio::test]
    async fn user_name_is_carried_on_newest_turn() {
        let store = Arc::new(LruMessageStore::default());
        let builder = builder(store, TokenBudget::default());

        let prompt = builder.build("hi", Some("alice"), None, None).await;

        assert_eq!(prompt.messages[0].name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn includes_ancestors_in_chronological_order() {
        let store = Arc::new(LruMessageStore::default());
        let first = ChatMessage::user("first question").with_id("a");
        let second = ChatMessage::assistant("first answer")
            .with_id("b")
            .with_parent("a");
        store.set("a", first).await.unwrap();
        store.set("b", second).await.unwrap();
        let builder = builder(store, TokenBudget::default());

        let prompt = builder
            .build("second question", None, Some("b"), Some("sys"))
            .await;

        let contents: Vec<_> = prompt.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["sys", "first question", "first answer", "second question"]
        );
        assert_eq!(prompt.messages[2].role, Role::Assistant);
    }

    #[tokio::test]
    async fn unresolvable_parent_truncates_silently() {
        let store = Arc::new(LruMessageStore::default());
        store
            .set("b", ChatMessage::assistant("answer").with_id("b").with_parent("gone"))
            .await
            .unwrap();
        let builder = builder(store, TokenBudget::default());

        let prompt = builder.build("next", None, Some("b"), None).await;

        assert_eq!(prompt.messages.len(), 2);
        assert_eq!(prompt.messages[0].content, "answer");
    }

    #[tokio::test]
    async fn only_whole_turns_that_fit_are_included() {
        let store = Arc::new(LruMessageStore::default());
        // Each ancestor renders as "User:\n" + 94 chars = 100 chars, plus a
        // 2 char separator. The newest turn "User:\nq" is 7 chars.
        let newest = seed_chain(&store, 50, 94).await;
        // 3 ancestors: 7 + 3 * 102 = 313; 4 ancestors: 415.
        let builder = builder(store, TokenBudget::new(1350, 1000));

        let prompt = builder.build("q", None, Some(&newest), None).await;

        assert_eq!(prompt.messages.len(), 4);
        assert_eq!(prompt.prompt_tokens, 313);
        assert!(prompt.messages[..3]
            .iter()
            .all(|m| m.content.len() == 94));
        assert!(prompt.messages[0].content.ends_with("47"));
        assert!(prompt.messages[1].content.ends_with("48"));
        assert!(prompt.messages[2].content.ends_with("49"));
        assert_eq!(prompt.messages[3].content, "q");
    }

    #[tokio::test]
    async fn never_exceeds_prompt_budget() {
        let store = Arc::new(LruMessageStore::default());
        let newest = seed_chain(&store, 20, 30).await;

        for max_model_tokens in [1100, 1150, 1200, 1400, 1800] {
            let budget = TokenBudget::new(max_model_tokens, 1000);
            let builder = builder(Arc::clone(&store), budget);

            let prompt = builder.build("latest", None, Some(&newest), Some("sys")).await;

            assert!(prompt.prompt_tokens <= budget.max_prompt_tokens());
            let rendered = char_estimator().estimate(&render_prompt(&prompt.messages));
            assert_eq!(rendered, prompt.prompt_tokens);
            assert_eq!(prompt.messages.first().map(|m| m.role), Some(Role::System));
            assert_eq!(prompt.messages.last().map(|m| m.content.as_str()), Some("latest"));

            // Ancestors keep ascending ids, i.e. chronological order.
            let history: Vec<_> = prompt.messages[1..prompt.messages.len() - 1]
                .iter()
                .map(|m| m.content.trim_start_matches('0').parse::<u32>().unwrap_or(0))
                .collect();
            assert!(history.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn oversized_first_turn_keeps_only_system_message() {
        let store = Arc::new(LruMessageStore::default());
        let builder = builder(store, TokenBudget::new(1050, 1000));

        let long_text = "x".repeat(200);
        let prompt = builder.build(&long_text, None, None, Some("sys")).await;

        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].role, Role::System);
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn get(&self, _id: &str) -> Result<Option<ChatMessage>, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }

        async fn set(&self, _id: &str, _message: ChatMessage) -> Result<(), StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn store_read_failure_truncates_history() {
        let builder = ContextBuilder::new(
            Arc::new(FailingStore),
            char_estimator(),
            TokenBudget::default(),
        );

        let prompt = builder.build("hello", None, Some("parent"), None).await;

        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].content, "hello");
    }
}
