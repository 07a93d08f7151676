//! Composition root.
//!
//! The engine owns every cache and background component and wires them
//! together once, at startup:
//! - Translation, conversation and message-page caches (one database each)
//! - The snapshot reader over the conversation cache
//! - The prefetch scheduler
//! - The change notifier, invalidating message-level caches and resyncing
//!   the first conversation page
//! - Periodic maintenance of every cache

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::evictor::MaintenanceReport;
use crate::cache::{CacheStats, TieredCache};
use crate::config::Config;
use crate::snapshot::{ConversationResync, SnapshotError, SnapshotPage, SnapshotReader};
use crate::source::{
    pager_for, ChangeFeed, ConversationQuery, Message, MessagePager, MessageQuery, SourceError, ThreadQuery,
};
use crate::storage::{PersistentTier, StoreError};
use crate::sync::pages::schedule_thread_prefetch;
use crate::sync::{
    ChangeNotifier, MessagePages, NotifierError, PageWindow, PrefetchScheduler, SchedulerError, ThreadInvalidation,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Cache storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Change notifier error: {0}")]
    Notifier(#[from] NotifierError),
}

#[derive(Debug, Clone, Serialize)]
pub struct PrefetchStats {
    pub enabled: bool,
    pub tracked: usize,
    pub completed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotifierStats {
    pub registered: bool,
    pub listeners: usize,
    pub events_handled: u64,
    pub listener_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub translations: CacheStats,
    pub conversations: CacheStats,
    pub messages: CacheStats,
    pub prefetch: PrefetchStats,
    pub notifier: NotifierStats,
}

pub struct Engine {
    config: Config,
    translations: Arc<TieredCache>,
    pages: Arc<MessagePages>,
    reader: Arc<SnapshotReader>,
    scheduler: Arc<PrefetchScheduler>,
    notifier: Arc<ChangeNotifier>,
    pager: Arc<dyn MessagePager>,
    maintenance: Mutex<Option<CancellationToken>>,
}

impl Engine {
    /// Open the caches and wire every component to `source`.
    ///
    /// Must be called from within a tokio runtime. Nothing is subscribed or
    /// scheduled until [`Engine::start`].
    pub async fn open<S>(config: Config, source: Arc<S>) -> Result<Self, EngineError>
    where
        S: ConversationQuery + ThreadQuery + MessageQuery + ChangeFeed + 'static,
    {
        let translations = Arc::new(open_cache(&config, "translations").await?);
        let conversations = Arc::new(open_cache(&config, "conversations").await?);
        let messages = Arc::new(open_cache(&config, "messages").await?);

        let scheduler = Arc::new(PrefetchScheduler::new(&config.prefetch)?);
        let reader = Arc::new(SnapshotReader::new(conversations, source.clone(), source.clone()));
        let pages = Arc::new(MessagePages::new(messages));

        let resync = Arc::new(ConversationResync::new(
            reader.clone(),
            scheduler.clone(),
            config.snapshot.page_size,
        ));
        let targets: Vec<Arc<dyn ThreadInvalidation>> = vec![
            pages.clone() as Arc<dyn ThreadInvalidation>,
            reader.clone() as Arc<dyn ThreadInvalidation>,
        ];
        let notifier = Arc::new(ChangeNotifier::new(source.clone(), resync, targets));
        let pager = pager_for(source);

        info!(
            in_memory = config.storage.in_memory,
            data_dir = %config.storage.data_dir.display(),
            pager = pager.name(),
            prefetch = config.prefetch.enabled,
            "Engine opened"
        );

        Ok(Self {
            config,
            translations,
            pages,
            reader,
            scheduler,
            notifier,
            pager,
            maintenance: Mutex::new(None),
        })
    }

    /// Subscribe to changes and start periodic maintenance.
    pub fn start(&self) -> Result<(), EngineError> {
        self.notifier.register()?;
        self.start_maintenance();
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn translations(&self) -> &Arc<TieredCache> {
        &self.translations
    }

    pub fn conversations(&self) -> &Arc<TieredCache> {
        self.reader.cache()
    }

    pub fn pages(&self) -> &Arc<MessagePages> {
        &self.pages
    }

    pub fn reader(&self) -> &Arc<SnapshotReader> {
        &self.reader
    }

    pub fn scheduler(&self) -> &Arc<PrefetchScheduler> {
        &self.scheduler
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    fn caches(&self) -> Vec<Arc<TieredCache>> {
        vec![
            self.translations.clone(),
            self.reader.cache().clone(),
            self.pages.cache().clone(),
        ]
    }

    /// Load a conversation page and warm the one after it.
    pub async fn load_conversations(&self, offset: usize, limit: usize) -> Result<SnapshotPage, SnapshotError> {
        let page = self.reader.load_page(offset, limit).await?;
        if page.has_more {
            self.reader.prefetch_page(&self.scheduler, offset + limit, limit);
        }
        Ok(page)
    }

    /// Load one page of a thread's messages, newest page first, and warm
    /// the older pages behind it.
    pub async fn load_messages(&self, thread_id: &str, page: usize) -> Result<Vec<Message>, SourceError> {
        let messages = match self.pages.get(thread_id, page).await {
            Some(messages) => messages,
            None => {
                let messages = self
                    .pager
                    .page(thread_id, page, self.config.prefetch.page_size)
                    .await?;
                self.pages.put(thread_id, page, &messages).await;
                messages
            }
        };

        if messages.len() == self.config.prefetch.page_size {
            self.prefetch_thread(thread_id, page + 1);
        }
        Ok(messages)
    }

    /// Schedule a warm-up of `thread_id`'s pages starting at `first_page`.
    pub fn prefetch_thread(&self, thread_id: &str, first_page: usize) -> bool {
        schedule_thread_prefetch(
            &self.scheduler,
            self.pager.clone(),
            self.pages.clone(),
            thread_id,
            PageWindow::from_config(&self.config.prefetch, first_page),
        )
    }

    /// Start the periodic maintenance loop. Returns `false` if it is
    /// already running.
    pub fn start_maintenance(&self) -> bool {
        let mut slot = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("Maintenance loop already running");
            return false;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let caches = self.caches();
        let interval = self.config.maintenance.interval();
        let run_on_startup = self.config.maintenance.run_on_startup;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if !run_on_startup {
                // The first tick fires immediately.
                ticker.tick().await;
            }
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        maintain(&caches).await;
                    }
                }
            }
            debug!("Maintenance loop stopped");
        });

        *slot = Some(token);
        info!(interval_secs = interval.as_secs(), run_on_startup, "Maintenance loop started");
        true
    }

    /// Run one maintenance pass over every cache now.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        maintain(&self.caches()).await
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            translations: self.translations.stats().await,
            conversations: self.reader.cache().stats().await,
            messages: self.pages.cache().stats().await,
            prefetch: PrefetchStats {
                enabled: self.scheduler.is_enabled(),
                tracked: self.scheduler.tracked(),
                completed: self.scheduler.completed(),
            },
            notifier: NotifierStats {
                registered: self.notifier.is_registered(),
                listeners: self.notifier.listener_count(),
                events_handled: self.notifier.events_handled(),
                listener_failures: self.notifier.listener_failures(),
            },
        }
    }

    /// Stop the subscription, the maintenance loop and every prefetch task.
    pub fn shutdown(&self) {
        self.notifier.unregister();
        if let Some(token) = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        self.scheduler.shutdown();
        info!("Engine shut down");
    }
}

async fn open_cache(config: &Config, name: &str) -> Result<TieredCache, StoreError> {
    let store = if config.storage.in_memory {
        PersistentTier::open_in_memory().await?
    } else {
        PersistentTier::open(config.storage.data_dir.join(format!("{name}.db"))).await?
    };
    Ok(TieredCache::open(
        name,
        &config.cache,
        config.compression.clone(),
        store,
    ))
}

async fn maintain(caches: &[Arc<TieredCache>]) -> MaintenanceReport {
    let mut total = MaintenanceReport::default();
    for cache in caches {
        match cache.maintenance().await {
            Ok(report) => total.merge(&report),
            Err(e) => warn!(cache = cache.name(), error = %e, "Cache maintenance failed"),
        }
    }
    info!(
        expired = total.expired,
        trimmed = total.trimmed,
        remaining = total.remaining,
        "Maintenance pass over all caches finished"
    );
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{InMemorySource, MessageKind};
    use std::time::Duration;

    async fn engine(source: &Arc<InMemorySource>) -> Engine {
        Engine::open(Config::ephemeral(), source.clone()).await.unwrap()
    }

    #[tokio::test]
    async fn test_caches_are_separate() {
        let source = Arc::new(InMemorySource::new());
        let engine = engine(&source).await;

        engine.translations().put("hello_es", "Hola").await;
        engine.notifier().handle_change(crate::source::RawChange::unspecified()).await;

        // Generic change clears message-level caches only.
        assert_eq!(engine.translations().get("hello_es").await.as_deref(), Some("Hola"));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_load_messages_caches_and_prefetches() {
        let source = Arc::new(InMemorySource::new());
        for i in 0..70 {
            source.insert_message("4", "555", &format!("m{i}"), MessageKind::Sms, i);
        }
        let engine = engine(&source).await;

        let first = engine.load_messages("4", 0).await.unwrap();
        assert_eq!(first.len(), 20);
        assert_eq!(first[0].body, "m69");
        assert!(engine.pages().contains("4", 0).await);

        for _ in 0..200 {
            if engine.pages().contains("4", 3).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.pages().contains("4", 1).await);
        assert!(engine.pages().contains("4", 3).await);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_stats_and_maintenance() {
        let source = Arc::new(InMemorySource::new());
        source.seed(3, 2);
        let engine = engine(&source).await;

        engine.load_conversations(0, 10).await.unwrap();
        let report = engine.run_maintenance().await;
        assert_eq!(report.total_removed(), 0);
        assert_eq!(report.remaining, 3);

        let stats = engine.stats().await;
        assert_eq!(stats.conversations.persistent_entries, 3);
        assert!(!stats.notifier.registered);

        engine.start().unwrap();
        assert!(engine.stats().await.notifier.registered);
        assert!(!engine.start_maintenance());
        engine.shutdown();
        assert!(!engine.stats().await.notifier.registered);
    }
}
