//! Wire shapes for the two conversation endpoints.

pub mod openai;
pub mod proxy;

use crate::sse::DONE_SENTINEL;

/// Whether an SSE `data:` payload is the end-of-stream marker.
pub fn is_done(data: &str) -> bool {
    data.trim() == DONE_SENTINEL
}
