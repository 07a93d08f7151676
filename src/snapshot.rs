//! Paginated conversation snapshots.
//!
//! Reads go to the optimized one-round-trip query first. If the store
//! rejects it, the reader lists threads and looks each one up separately,
//! skipping threads whose snapshot is already cached. Every resolved
//! snapshot is cached under its thread id.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheKey, TieredCache};
use crate::source::{ConversationQuery, ConversationSnapshot, SourceError, ThreadQuery};
use crate::sync::{ChangeEvent, PrefetchScheduler, ResyncScheduler, ThreadInvalidation};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Conversation listing failed: {0}")]
    Listing(#[source] SourceError),
}

/// Which query produced a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageSource {
    Optimized,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotPage {
    pub snapshots: Vec<ConversationSnapshot>,

    /// True iff a full page came back.
    pub has_more: bool,

    pub source: PageSource,
}

impl SnapshotPage {
    fn new(snapshots: Vec<ConversationSnapshot>, limit: usize, source: PageSource) -> Self {
        let has_more = limit > 0 && snapshots.len() == limit;
        Self {
            snapshots,
            has_more,
            source,
        }
    }
}

pub struct SnapshotReader {
    cache: Arc<TieredCache>,
    optimized: Arc<dyn ConversationQuery>,
    fallback: Arc<dyn ThreadQuery>,
}

impl SnapshotReader {
    pub fn new(
        cache: Arc<TieredCache>,
        optimized: Arc<dyn ConversationQuery>,
        fallback: Arc<dyn ThreadQuery>,
    ) -> Self {
        Self {
            cache,
            optimized,
            fallback,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Load `limit` conversations starting at `offset`, newest first.
    ///
    /// Only a failure to list threads on the fallback path is an error; a
    /// thread whose lookup fails is left out of the page.
    pub async fn load_page(&self, offset: usize, limit: usize) -> Result<SnapshotPage, SnapshotError> {
        if limit == 0 {
            return Ok(SnapshotPage::new(Vec::new(), limit, PageSource::Optimized));
        }

        match self.optimized.latest_per_thread(offset, limit).await {
            Ok(mut snapshots) => {
                snapshots.truncate(limit);
                for snapshot in &snapshots {
                    self.store(snapshot).await;
                }
                debug!(offset, limit, loaded = snapshots.len(), "Loaded conversations via optimized query");
                Ok(SnapshotPage::new(snapshots, limit, PageSource::Optimized))
            }
            Err(e) => {
                warn!(offset, limit, error = %e, "Optimized conversation query failed, falling back");
                self.load_fallback(offset, limit).await
            }
        }
    }

    async fn load_fallback(&self, offset: usize, limit: usize) -> Result<SnapshotPage, SnapshotError> {
        let threads = self
            .fallback
            .list_threads(offset, limit)
            .await
            .map_err(SnapshotError::Listing)?;

        let mut snapshots = Vec::with_capacity(threads.len().min(limit));
        let mut cache_hits = 0usize;
        for thread_id in threads.iter().take(limit) {
            if let Some(snapshot) = self.cached(thread_id).await {
                cache_hits += 1;
                snapshots.push(snapshot);
                continue;
            }
            match self.fallback.thread_latest(thread_id).await {
                Ok(Some(snapshot)) => {
                    self.store(&snapshot).await;
                    snapshots.push(snapshot);
                }
                Ok(None) => debug!(thread_id = %thread_id, "Thread has no messages, skipping"),
                Err(e) => warn!(thread_id = %thread_id, error = %e, "Thread lookup failed, omitting"),
            }
        }

        debug!(
            offset,
            limit,
            loaded = snapshots.len(),
            cache_hits,
            "Loaded conversations via fallback"
        );
        Ok(SnapshotPage::new(snapshots, limit, PageSource::Fallback))
    }

    /// Cached snapshot for `thread_id`, if any.
    pub async fn cached(&self, thread_id: &str) -> Option<ConversationSnapshot> {
        let key = CacheKey::conversation(thread_id);
        let json = self.cache.get(&key).await?;
        match serde_json::from_str(&json) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable conversation snapshot, deleting");
                self.cache.delete(&key).await;
                None
            }
        }
    }

    async fn store(&self, snapshot: &ConversationSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(json) => {
                self.cache
                    .put(&CacheKey::conversation(&snapshot.thread_id), &json)
                    .await
            }
            Err(e) => warn!(thread_id = %snapshot.thread_id, error = %e, "Failed to encode snapshot"),
        }
    }

    /// Warm a page in the background. Returns `false` if a warm-up for the
    /// same page is already scheduled.
    pub fn prefetch_page(self: &Arc<Self>, scheduler: &PrefetchScheduler, offset: usize, limit: usize) -> bool {
        let reader = Arc::clone(self);
        scheduler.schedule(page_prefetch_key(offset), move |cancel| async move {
            if cancel.is_cancelled() {
                return anyhow::Ok(());
            }
            let page = reader.load_page(offset, limit).await?;
            debug!(offset, loaded = page.snapshots.len(), "Conversation page warmed");
            anyhow::Ok(())
        })
    }
}

/// Scheduler key for warming the conversation page at `offset`.
pub fn page_prefetch_key(offset: usize) -> String {
    format!("conversations:{offset}")
}

#[async_trait]
impl ThreadInvalidation for SnapshotReader {
    async fn invalidate_thread(&self, thread_id: &str) {
        self.cache.delete(&CacheKey::conversation(thread_id)).await;
    }

    async fn invalidate_all(&self) {
        self.cache.clear().await;
    }
}

/// Resync by re-reading the first conversation page.
///
/// Every request maps to the same scheduler key, so a burst of change
/// notifications turns into a single debounced refresh.
pub struct ConversationResync {
    reader: Arc<SnapshotReader>,
    scheduler: Arc<PrefetchScheduler>,
    page_size: usize,
}

impl ConversationResync {
    pub fn new(reader: Arc<SnapshotReader>, scheduler: Arc<PrefetchScheduler>, page_size: usize) -> Self {
        Self {
            reader,
            scheduler,
            page_size,
        }
    }
}

impl ResyncScheduler for ConversationResync {
    fn request_resync(&self, event: &ChangeEvent) {
        let scheduled = self.reader.prefetch_page(&self.scheduler, 0, self.page_size);
        debug!(kind = ?event.kind, scheduled, "Resync requested");
    }
}
