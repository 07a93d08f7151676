//! Message page cache and the older-pages prefetch task.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheKey, TieredCache};
use crate::config::PrefetchConfig;
use crate::source::{Message, MessagePager};
use crate::sync::notifier::ThreadInvalidation;
use crate::sync::scheduler::PrefetchScheduler;

/// Pages of thread messages, stored as JSON under `<thread>_page_<n>`.
pub struct MessagePages {
    cache: Arc<TieredCache>,
}

impl MessagePages {
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub async fn contains(&self, thread_id: &str, page: usize) -> bool {
        self.cache.contains(&CacheKey::message_page(thread_id, page)).await
    }

    pub async fn get(&self, thread_id: &str, page: usize) -> Option<Vec<Message>> {
        let key = CacheKey::message_page(thread_id, page);
        let json = self.cache.get(&key).await?;
        match serde_json::from_str(&json) {
            Ok(messages) => Some(messages),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable message page, deleting");
                self.cache.delete(&key).await;
                None
            }
        }
    }

    pub async fn put(&self, thread_id: &str, page: usize, messages: &[Message]) {
        match serde_json::to_string(messages) {
            Ok(json) => {
                self.cache
                    .put(&CacheKey::message_page(thread_id, page), &json)
                    .await
            }
            Err(e) => warn!(thread_id, page, error = %e, "Failed to encode message page"),
        }
    }
}

#[async_trait]
impl ThreadInvalidation for MessagePages {
    async fn invalidate_thread(&self, thread_id: &str) {
        let removed = self
            .cache
            .remove_prefix(&CacheKey::message_pages_prefix(thread_id))
            .await;
        debug!(thread_id, removed, "Dropped cached message pages");
    }

    async fn invalidate_all(&self) {
        self.cache.clear().await;
    }
}

/// Which pages one prefetch task covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub first_page: usize,
    pub pages: usize,
    pub page_size: usize,
}

impl PageWindow {
    pub fn from_config(config: &PrefetchConfig, first_page: usize) -> Self {
        Self {
            first_page,
            pages: config.pages_per_task,
            page_size: config.page_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Every page in the window was fetched or already cached.
    Completed,
    /// The source returned an empty page.
    Exhausted,
    Cancelled,
    /// A page fetch failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefetchOutcome {
    pub fetched: usize,
    pub skipped: usize,
    pub stop: StopReason,
}

/// Warm the pages in `window` for `thread_id`.
///
/// Pages already cached are skipped. Stops at the first empty page, the
/// first failed fetch, or when `cancel` fires.
pub async fn prefetch_older_pages(
    pager: &dyn MessagePager,
    pages: &MessagePages,
    thread_id: &str,
    window: PageWindow,
    cancel: &CancellationToken,
) -> PrefetchOutcome {
    let mut outcome = PrefetchOutcome {
        fetched: 0,
        skipped: 0,
        stop: StopReason::Completed,
    };

    for page in window.first_page..window.first_page + window.pages {
        if cancel.is_cancelled() {
            outcome.stop = StopReason::Cancelled;
            break;
        }

        if pages.contains(thread_id, page).await {
            outcome.skipped += 1;
            continue;
        }

        match pager.page(thread_id, page, window.page_size).await {
            Ok(messages) if messages.is_empty() => {
                outcome.stop = StopReason::Exhausted;
                break;
            }
            Ok(messages) => {
                pages.put(thread_id, page, &messages).await;
                outcome.fetched += 1;
            }
            Err(e) => {
                warn!(thread_id, page, error = %e, "Page prefetch failed");
                outcome.stop = StopReason::Failed;
                break;
            }
        }
    }

    debug!(
        thread_id,
        fetched = outcome.fetched,
        skipped = outcome.skipped,
        stop = ?outcome.stop,
        "Older pages prefetched"
    );
    outcome
}

/// Scheduler key for a thread's page prefetch.
pub fn thread_prefetch_key(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

/// Schedule [`prefetch_older_pages`] for `thread_id` on `scheduler`.
pub fn schedule_thread_prefetch(
    scheduler: &PrefetchScheduler,
    pager: Arc<dyn MessagePager>,
    pages: Arc<MessagePages>,
    thread_id: &str,
    window: PageWindow,
) -> bool {
    let thread = thread_id.to_string();
    scheduler.schedule(thread_prefetch_key(thread_id), move |cancel| async move {
        prefetch_older_pages(pager.as_ref(), &pages, &thread, window, &cancel).await;
        anyhow::Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CompressionConfig};
    use crate::source::{pager_for, InMemorySource, MessageKind};

    async fn pages() -> MessagePages {
        let cache = TieredCache::in_memory("messages", &CacheConfig::default(), CompressionConfig::default())
            .await
            .unwrap();
        MessagePages::new(Arc::new(cache))
    }

    fn source_with(messages: i64) -> Arc<InMemorySource> {
        let source = InMemorySource::new();
        for i in 0..messages {
            source.insert_message("t1", "555", &format!("m{i}"), MessageKind::Sms, i);
        }
        Arc::new(source)
    }

    fn window(first_page: usize, pages: usize) -> PageWindow {
        PageWindow {
            first_page,
            pages,
            page_size: 2,
        }
    }

    #[tokio::test]
    async fn test_fetches_window() {
        let pages = pages().await;
        let pager = pager_for(source_with(10));

        let outcome = prefetch_older_pages(pager.as_ref(), &pages, "t1", window(1, 3), &CancellationToken::new()).await;

        assert_eq!(outcome.fetched, 3);
        assert_eq!(outcome.stop, StopReason::Completed);
        let page1 = pages.get("t1", 1).await.unwrap();
        assert_eq!(page1[0].body, "m7");
        assert!(!pages.contains("t1", 0).await);
    }

    #[tokio::test]
    async fn test_skips_cached_pages() {
        let pages = pages().await;
        pages.put("t1", 1, &[]).await;
        let pager = pager_for(source_with(10));

        let outcome = prefetch_older_pages(pager.as_ref(), &pages, "t1", window(1, 2), &CancellationToken::new()).await;

        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.fetched, 1);
        assert!(pages.get("t1", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stops_on_empty_page() {
        let pages = pages().await;
        let pager = pager_for(source_with(3));

        let outcome = prefetch_older_pages(pager.as_ref(), &pages, "t1", window(0, 5), &CancellationToken::new()).await;

        assert_eq!(outcome.fetched, 2);
        assert_eq!(outcome.stop, StopReason::Exhausted);
    }

    #[tokio::test]
    async fn test_stops_on_error() {
        let pages = pages().await;
        let source = source_with(10);
        source.set_unavailable(true);
        let pager = pager_for(source);

        let outcome = prefetch_older_pages(pager.as_ref(), &pages, "t1", window(0, 3), &CancellationToken::new()).await;

        assert_eq!(outcome.fetched, 0);
        assert_eq!(outcome.stop, StopReason::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let pages = pages().await;
        let pager = pager_for(source_with(10));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = prefetch_older_pages(pager.as_ref(), &pages, "t1", window(0, 3), &cancel).await;

        assert_eq!(outcome.stop, StopReason::Cancelled);
        assert_eq!(outcome.fetched, 0);
    }

    #[tokio::test]
    async fn test_invalidation_is_thread_scoped() {
        let pages = pages().await;
        pages.put("1", 0, &[]).await;
        pages.put("1", 1, &[]).await;
        pages.put("10", 0, &[]).await;

        pages.invalidate_thread("1").await;
        assert!(!pages.contains("1", 0).await);
        assert!(!pages.contains("1", 1).await);
        assert!(pages.contains("10", 0).await);

        pages.invalidate_all().await;
        assert!(!pages.contains("10", 0).await);
    }

    #[tokio::test]
    async fn test_scheduled_prefetch_warms_cache() {
        let config = PrefetchConfig {
            debounce_ms: 5,
            ..Default::default()
        };
        let scheduler = PrefetchScheduler::new(&config).unwrap();
        let pages = Arc::new(pages().await);
        let pager = pager_for(source_with(10));

        assert!(schedule_thread_prefetch(&scheduler, pager.clone(), pages.clone(), "t1", window(1, 2)));
        assert!(!schedule_thread_prefetch(&scheduler, pager, pages.clone(), "t1", window(1, 2)));

        for _ in 0..200 {
            if scheduler.tracked() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(pages.contains("t1", 1).await);
        assert!(pages.contains("t1", 2).await);
    }
}
