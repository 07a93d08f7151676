//! Cache keys and entries.
//!
//! Keys are plain strings built from the logical inputs they stand for, so
//! the same inputs always map to the same key. Each key family has its own
//! builder to keep unrelated entities from colliding.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Key builders for every family of cached value.
pub struct CacheKey;

impl CacheKey {
    /// Translated text: `originalText_targetLanguage`.
    pub fn translation(original: &str, target_language: &str) -> String {
        format!("{original}_{target_language}")
    }

    /// Per-message translation state blob.
    pub fn message_state(message_id: i64) -> String {
        format!("msg_{message_id}_translation_state")
    }

    /// One page of a thread's messages, newest page first.
    pub fn message_page(thread_id: &str, page: usize) -> String {
        format!("{thread_id}_page_{page}")
    }

    /// Prefix shared by every message page of a thread.
    pub fn message_pages_prefix(thread_id: &str) -> String {
        format!("{thread_id}_page_")
    }

    /// Conversation snapshot for a thread.
    pub fn conversation(thread_id: &str) -> String {
        thread_id.to_string()
    }
}

/// A row of the persistent tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,

    /// Framed (possibly compressed) payload.
    pub value: Vec<u8>,

    /// Last write or read-hit, used for TTL and size eviction.
    pub stored_at: Millis,
}
