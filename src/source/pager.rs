//! Message paging capability.
//!
//! Some stores answer offset/limit queries directly; others can only hand
//! back a whole thread. Which one a store is gets decided once, when the
//! pager is built.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Message, MessageQuery, SourceError};

/// Fetches page `page` (0 = newest) of a thread's messages.
#[async_trait]
pub trait MessagePager: Send + Sync {
    async fn page(&self, thread_id: &str, page: usize, page_size: usize) -> Result<Vec<Message>, SourceError>;

    fn name(&self) -> &'static str;
}

/// Pager over a store with native offset/limit support.
pub struct PaginatedSource {
    query: Arc<dyn MessageQuery>,
}

impl PaginatedSource {
    pub fn new(query: Arc<dyn MessageQuery>) -> Self {
        Self { query }
    }
}

#[async_trait]
impl MessagePager for PaginatedSource {
    async fn page(&self, thread_id: &str, page: usize, page_size: usize) -> Result<Vec<Message>, SourceError> {
        self.query
            .message_page(thread_id, page.saturating_mul(page_size), page_size)
            .await
    }

    fn name(&self) -> &'static str {
        "paginated"
    }
}

/// Pager that loads the whole thread and slices it.
pub struct FullScanSource {
    query: Arc<dyn MessageQuery>,
}

impl FullScanSource {
    pub fn new(query: Arc<dyn MessageQuery>) -> Self {
        Self { query }
    }
}

#[async_trait]
impl MessagePager for FullScanSource {
    async fn page(&self, thread_id: &str, page: usize, page_size: usize) -> Result<Vec<Message>, SourceError> {
        let all = self.query.thread_messages(thread_id).await?;
        Ok(all
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect())
    }

    fn name(&self) -> &'static str {
        "full-scan"
    }
}

/// Pick the pager implementation `query` supports.
pub fn pager_for(query: Arc<dyn MessageQuery>) -> Arc<dyn MessagePager> {
    let pager: Arc<dyn MessagePager> = if query.supports_pagination() {
        Arc::new(PaginatedSource::new(query))
    } else {
        Arc::new(FullScanSource::new(query))
    };
    debug!(pager = pager.name(), "Selected message pager");
    pager
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{InMemorySource, MessageKind};

    fn source(paginated: bool) -> Arc<InMemorySource> {
        let source = if paginated {
            InMemorySource::new()
        } else {
            InMemorySource::without_pagination()
        };
        for i in 0..5 {
            source.insert_message("t1", "555-0100", &format!("m{i}"), MessageKind::Sms, 1_000 + i);
        }
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_pager_selection() {
        assert_eq!(pager_for(source(true)).name(), "paginated");
        assert_eq!(pager_for(source(false)).name(), "full-scan");
    }

    #[tokio::test]
    async fn test_both_pagers_agree() {
        let paginated = pager_for(source(true));
        let full_scan = pager_for(source(false));

        for page in 0..3 {
            let a = paginated.page("t1", page, 2).await.unwrap();
            let b = full_scan.page("t1", page, 2).await.unwrap();
            let bodies_a: Vec<_> = a.iter().map(|m| m.body.clone()).collect();
            let bodies_b: Vec<_> = b.iter().map(|m| m.body.clone()).collect();
            assert_eq!(bodies_a, bodies_b);
        }

        let first = paginated.page("t1", 0, 2).await.unwrap();
        assert_eq!(first[0].body, "m4");
        assert!(paginated.page("t1", 3, 2).await.unwrap().is_empty());
    }
}
