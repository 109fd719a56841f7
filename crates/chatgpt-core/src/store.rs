use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::message::ChatMessage;

/// Entry ceiling of the default in-process store.
pub const DEFAULT_STORE_CAPACITY: usize = 10_000;

/// Keyed persistence for conversation turns.
///
/// Implementations must tolerate concurrent reads and writes; concurrent
/// writes to the same id resolve as last-writer-wins.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ChatMessage>, StoreError>;
    async fn set(&self, id: &str, message: ChatMessage) -> Result<(), StoreError>;
}

pub type SharedMessageStore = Arc<dyn MessageStore>;

/// Bounded in-memory store. History older than the capacity is evicted, and
/// nothing survives a process restart.
#[derive(Debug)]
pub struct LruMessageStore {
    cache: Mutex<LruCache<String, ChatMessage>>,
}

impl LruMessageStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}

impl Default for LruMessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }
}

#[async_trait]
impl MessageStore for LruMessageStore {
    async fn get(&self, id: &str) -> Result<Option<ChatMessage>, StoreError> {
        let mut cache = self.cache.lock().await;
        Ok(cache.get(id).cloned())
    }

    async fn set(&self, id: &str, message: ChatMessage) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().await;
        cache.put(id.to_string(), message);
        Ok(())
    }
}
