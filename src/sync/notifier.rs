//! Change notification: watches the message store and fans changes out.
//!
//! For every raw change the notifier:
//! 1. Classifies it as SMS, MMS, conversation or generic
//! 2. Invalidates the message-level caches, once
//! 3. Asks for a resync, once
//! 4. Calls exactly one typed callback on each listener
//!
//! Listener callbacks run on the notifier's task and must return quickly.
//! Anything slow belongs on its own task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::source::{ChangeFeed, RawChange, ResourceClass, SourceError};

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("Change subscription failed: {0}")]
    Subscribe(#[from] SourceError),

    #[error("Change notifier needs a tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// What kind of resource a change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Sms,
    Mms,
    Conversation,
    Generic,
}

impl ChangeKind {
    pub fn classify(uri: Option<&str>) -> Self {
        let Some(uri) = uri else {
            return ChangeKind::Generic;
        };
        if uri.contains(ResourceClass::CONVERSATIONS_URI) {
            ChangeKind::Conversation
        } else if uri.contains(ResourceClass::SMS_URI) {
            ChangeKind::Sms
        } else if uri.contains(ResourceClass::MMS_URI) && !uri.contains(ResourceClass::ALL_URI) {
            ChangeKind::Mms
        } else {
            ChangeKind::Generic
        }
    }
}

/// A classified change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub source_uri: Option<String>,
    pub kind: ChangeKind,

    /// Thread the change is scoped to, when the URI names one.
    pub thread_id: Option<String>,

    pub self_change: bool,
}

impl ChangeEvent {
    pub fn from_raw(change: &RawChange) -> Self {
        let uri = change.uri.as_deref();
        Self {
            source_uri: change.uri.clone(),
            kind: ChangeKind::classify(uri),
            thread_id: uri.and_then(extract_thread_id),
            self_change: change.self_change,
        }
    }
}

/// Thread id named by a change URI.
///
/// Recognizes a `thread_id=<id>` query parameter, or a path whose first
/// segment is `conversations` or `threads`.
pub fn extract_thread_id(uri: &str) -> Option<String> {
    if let Some((_, rest)) = uri.split_once("thread_id=") {
        let id = rest.split('&').next().unwrap_or_default();
        return (!id.is_empty()).then(|| id.to_string());
    }

    let after_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let (_, path) = after_scheme.split_once('/')?;
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    match (segments.next(), segments.next()) {
        (Some("conversations" | "threads"), Some(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// Receives classified changes. Implement the callbacks you care about.
pub trait ChangeListener: Send + Sync {
    fn on_sms_changed(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_mms_changed(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_conversation_changed(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// Catch-all for changes no specific callback matches.
    fn on_content_changed(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A cache that can drop what it holds for one thread, or everything.
#[async_trait]
pub trait ThreadInvalidation: Send + Sync {
    async fn invalidate_thread(&self, thread_id: &str);

    async fn invalidate_all(&self);
}

/// Arranges for cached data to be re-read from the store.
pub trait ResyncScheduler: Send + Sync {
    fn request_resync(&self, event: &ChangeEvent);
}

pub struct ChangeNotifier {
    feed: Arc<dyn ChangeFeed>,
    resync: Arc<dyn ResyncScheduler>,
    targets: Vec<Arc<dyn ThreadInvalidation>>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    subscription: Mutex<Option<CancellationToken>>,
    events_handled: AtomicU64,
    listener_failures: AtomicU64,
}

impl ChangeNotifier {
    const CLASSES: [ResourceClass; 3] = [
        ResourceClass::Sms,
        ResourceClass::Mms,
        ResourceClass::Conversations,
    ];

    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        resync: Arc<dyn ResyncScheduler>,
        targets: Vec<Arc<dyn ThreadInvalidation>>,
    ) -> Self {
        Self {
            feed,
            resync,
            targets,
            listeners: RwLock::new(Vec::new()),
            subscription: Mutex::new(None),
            events_handled: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
        }
    }

    /// Subscribe to the store's change feed.
    ///
    /// Returns `Ok(false)` if already registered, and an error outside a
    /// tokio runtime.
    pub fn register(self: &Arc<Self>) -> Result<bool, NotifierError> {
        let mut subscription = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() {
            debug!("Change notifier already registered");
            return Ok(false);
        }

        let handle = Handle::try_current()?;
        let rx = self.feed.subscribe(&Self::CLASSES)?;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let notifier = Arc::downgrade(self);

        handle.spawn(async move {
            let mut changes = BroadcastStream::new(rx);
            loop {
                let next = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    next = changes.next() => next,
                };
                let Some(notifier) = notifier.upgrade() else {
                    break;
                };
                match next {
                    Some(Ok(change)) => notifier.handle_change(change).await,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "Change feed lagged, treating as a generic change");
                        notifier.handle_change(RawChange::unspecified()).await;
                    }
                    None => {
                        warn!("Change feed closed");
                        break;
                    }
                }
            }
            debug!("Change subscription task stopped");
        });

        *subscription = Some(token);
        info!("Change notifier registered");
        Ok(true)
    }

    /// Drop the feed subscription. Returns `false` if not registered.
    pub fn unregister(&self) -> bool {
        let token = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        match token {
            Some(token) => {
                token.cancel();
                info!("Change notifier unregistered");
                true
            }
            None => {
                debug!("Change notifier was not registered");
                false
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Add a listener. Adding the same listener twice is a no-op.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        debug!(count = listeners.len(), "Listener added");
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != listeners.len()
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn events_handled(&self) -> u64 {
        self.events_handled.load(Ordering::Relaxed)
    }

    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }

    /// Process one raw change: invalidate, resync, dispatch.
    pub async fn handle_change(&self, change: RawChange) {
        let event = ChangeEvent::from_raw(&change);
        self.events_handled.fetch_add(1, Ordering::Relaxed);
        debug!(
            uri = event.source_uri.as_deref().unwrap_or("<none>"),
            kind = ?event.kind,
            self_change = event.self_change,
            "Content change"
        );

        self.invalidate(&event).await;
        self.resync.request_resync(&event);
        self.dispatch(&event);
    }

    async fn invalidate(&self, event: &ChangeEvent) {
        match &event.thread_id {
            Some(thread_id) => {
                for target in &self.targets {
                    target.invalidate_thread(thread_id).await;
                }
                debug!(thread_id = %thread_id, "Invalidated caches for thread");
            }
            None => {
                for target in &self.targets {
                    target.invalidate_all().await;
                }
                debug!("Invalidated all message caches");
            }
        }
    }

    fn dispatch(&self, event: &ChangeEvent) {
        // Snapshot so listeners can add/remove listeners from a callback.
        let listeners: Vec<Arc<dyn ChangeListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, listener) in listeners.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match event.kind {
                ChangeKind::Sms => listener.on_sms_changed(event),
                ChangeKind::Mms => listener.on_mms_changed(event),
                ChangeKind::Conversation => listener.on_conversation_changed(event),
                ChangeKind::Generic => listener.on_content_changed(event),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.listener_failures.fetch_add(1, Ordering::Relaxed);
                    error!(listener = index, kind = ?event.kind, error = %e, "Change listener failed");
                }
                Err(_) => {
                    self.listener_failures.fetch_add(1, Ordering::Relaxed);
                    error!(listener = index, kind = ?event.kind, "Change listener panicked");
                }
            }
        }
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        if let Some(token) = self
            .subscription
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}
