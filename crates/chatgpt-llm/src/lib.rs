pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod providers;
pub mod sse;
pub mod transport;

pub use chatgpt_core::{
    ChatMessage, CompletionUsage, LruMessageStore, MessageStore, Role, SharedMessageStore,
    TokenBudget,
};
pub use client::{ConversationClient, ProgressCallback, SendMessageOptions};
pub use config::ClientConfig;
pub use error::{ChatGptError, Result};
pub use protocol::openai::CompletionParams;
pub use providers::openai::default_system_message;
pub use providers::proxy::is_valid_uuid_v4;
pub use providers::{ChatGptApi, ChatGptUnofficialProxyApi};
pub use transport::{
    ReqwestTransport, ResponseBody, SharedTransport, Transport, TransportRequest,
    TransportResponse,
};
