pub mod context;
pub mod error;
pub mod message;
pub mod store;
pub mod tokens;

pub use context::{
    render_prompt, ContextBuilder, PromptAssembly, PromptMessage, TokenBudget,
    DEFAULT_MAX_MODEL_TOKENS, DEFAULT_MAX_RESPONSE_TOKENS,
};
pub use error::{StoreError, TokenizerError};
pub use message::{ChatMessage, CompletionUsage, Role};
pub use store::{LruMessageStore, MessageStore, SharedMessageStore, DEFAULT_STORE_CAPACITY};
pub use tokens::{
    default_estimator, HeuristicTokenEstimator, SharedTokenEstimator, TiktokenEstimator,
    TokenEstimator, END_OF_TEXT_MARKER,
};
