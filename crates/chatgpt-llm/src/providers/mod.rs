pub mod openai;
pub mod proxy;

pub use openai::ChatGptApi;
pub use proxy::ChatGptUnofficialProxyApi;
