//! Ports onto the external message store.
//!
//! The store is owned by someone else and may change at any time. The engine
//! only ever sees it through these traits:
//! - [`ConversationQuery`]: optimized latest-row-per-thread query
//! - [`ThreadQuery`]: slower list-then-lookup fallback
//! - [`MessageQuery`]: message pages for a thread
//! - [`ChangeFeed`]: change notifications

pub mod memory;
pub mod pager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::cache::entry::Millis;

pub use memory::InMemorySource;
pub use pager::{pager_for, FullScanSource, MessagePager, PaginatedSource};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Query rejected by source: {0}")]
    Rejected(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Change feed closed")]
    Closed,
}

/// Latest state of one conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub thread_id: String,
    pub address: String,
    pub snippet: String,
    pub last_message_date: Millis,
    pub is_read: bool,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Sms,
    Mms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub thread_id: String,
    pub address: String,
    pub body: String,
    pub date: Millis,
    pub kind: MessageKind,
    pub read: bool,
}

/// A change notification as delivered by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    /// Changed resource, if the store said which one.
    pub uri: Option<String>,

    /// The change was made by this process.
    pub self_change: bool,
}

impl RawChange {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            self_change: false,
        }
    }

    /// A change with no resource identifier.
    pub fn unspecified() -> Self {
        Self {
            uri: None,
            self_change: false,
        }
    }
}

/// Resource classes a change subscription can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Sms,
    Mms,
    Conversations,
    All,
}

impl ResourceClass {
    pub const SMS_URI: &'static str = "content://sms";
    pub const MMS_URI: &'static str = "content://mms";
    pub const CONVERSATIONS_URI: &'static str = "content://mms-sms/conversations";
    pub const ALL_URI: &'static str = "content://mms-sms";

    /// Root URI of the class.
    pub fn uri(self) -> &'static str {
        match self {
            ResourceClass::Sms => Self::SMS_URI,
            ResourceClass::Mms => Self::MMS_URI,
            ResourceClass::Conversations => Self::CONVERSATIONS_URI,
            ResourceClass::All => Self::ALL_URI,
        }
    }

    /// Whether a change to `uri` falls under this class.
    pub fn covers(self, uri: &str) -> bool {
        match self {
            ResourceClass::All => true,
            ResourceClass::Mms => uri.starts_with(Self::MMS_URI) && !uri.starts_with(Self::ALL_URI),
            other => uri.starts_with(other.uri()),
        }
    }
}

/// Optimized one-round-trip conversation listing.
#[async_trait]
pub trait ConversationQuery: Send + Sync {
    /// Latest message of each thread with its unread count, newest thread
    /// first, `limit` threads starting at `offset`.
    async fn latest_per_thread(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ConversationSnapshot>, SourceError>;
}

/// Basic two-step conversation listing.
#[async_trait]
pub trait ThreadQuery: Send + Sync {
    /// Thread ids, most recently active first.
    async fn list_threads(&self, offset: usize, limit: usize) -> Result<Vec<String>, SourceError>;

    /// Latest row and unread count of a single thread.
    async fn thread_latest(&self, thread_id: &str) -> Result<Option<ConversationSnapshot>, SourceError>;
}

#[async_trait]
pub trait MessageQuery: Send + Sync {
    /// Whether [`MessageQuery::message_page`] is backed by a real
    /// offset/limit query.
    fn supports_pagination(&self) -> bool;

    /// Messages of a thread, newest first, `limit` starting at `offset`.
    async fn message_page(
        &self,
        thread_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError>;

    /// Every message of a thread, newest first.
    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<Message>, SourceError>;
}

pub trait ChangeFeed: Send + Sync {
    /// Subscribe to changes under any of `classes`.
    fn subscribe(&self, classes: &[ResourceClass]) -> Result<broadcast::Receiver<RawChange>, SourceError>;
}
