use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Message store backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
#[error("Failed to load tokenizer: {0}")]
pub struct TokenizerError(pub String);
