//! In-process message store.
//!
//! Implements every source port over a plain vector of messages and emits a
//! change notification for each mutation. The binary serves it behind the
//! admin API; tests use its failure switches to drive the fallback paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    ChangeFeed, ConversationQuery, ConversationSnapshot, Message, MessageKind, MessageQuery, RawChange,
    ResourceClass, SourceError, ThreadQuery,
};
use crate::cache::entry::Millis;

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct Store {
    messages: Vec<Message>,
    next_id: i64,
}

impl Store {
    /// Messages of one thread, newest first.
    fn thread(&self, thread_id: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));
        messages
    }

    fn snapshot(&self, thread_id: &str) -> Option<ConversationSnapshot> {
        let messages = self.thread(thread_id);
        let latest = messages.first()?;
        let unread_count = messages.iter().filter(|m| !m.read).count() as u32;
        Some(ConversationSnapshot {
            thread_id: thread_id.to_string(),
            address: latest.address.clone(),
            snippet: match latest.kind {
                MessageKind::Sms => latest.body.clone(),
                MessageKind::Mms => "[MMS]".to_string(),
            },
            last_message_date: latest.date,
            is_read: latest.read,
            unread_count,
        })
    }

    /// Thread ids ordered by their latest message, newest first.
    fn threads_by_recency(&self) -> Vec<String> {
        let mut latest: BTreeMap<&str, Millis> = BTreeMap::new();
        for m in &self.messages {
            let entry = latest.entry(m.thread_id.as_str()).or_insert(m.date);
            if m.date > *entry {
                *entry = m.date;
            }
        }
        let mut threads: Vec<(&str, Millis)> = latest.into_iter().collect();
        threads.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        threads.into_iter().map(|(id, _)| id.to_string()).collect()
    }
}

/// One change subscription and the classes it asked for.
struct Subscription {
    classes: Vec<ResourceClass>,
    sender: broadcast::Sender<RawChange>,
}

impl Subscription {
    /// Changes without a URI reach every subscription.
    fn wants(&self, change: &RawChange) -> bool {
        match change.uri.as_deref() {
            Some(uri) => self.classes.iter().any(|class| class.covers(uri)),
            None => true,
        }
    }
}

/// Mutable in-memory message store.
pub struct InMemorySource {
    store: RwLock<Store>,
    subscriptions: Mutex<Vec<Subscription>>,
    paginated: bool,
    fail_optimized: AtomicBool,
    unavailable: AtomicBool,
    failing_threads: RwLock<HashSet<String>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::with_pagination(true)
    }

    /// A store that can only return whole threads.
    pub fn without_pagination() -> Self {
        Self::with_pagination(false)
    }

    fn with_pagination(paginated: bool) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            subscriptions: Mutex::new(Vec::new()),
            paginated,
            fail_optimized: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            failing_threads: RwLock::new(HashSet::new()),
        }
    }

    /// Fill the store with `threads` threads of `per_thread` messages each.
    ///
    /// Does not emit change notifications.
    pub fn seed(&self, threads: usize, per_thread: usize) {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        for t in 0..threads {
            for m in 0..per_thread {
                store.next_id += 1;
                let id = store.next_id;
                let kind = if m % 5 == 4 { MessageKind::Mms } else { MessageKind::Sms };
                store.messages.push(Message {
                    id,
                    thread_id: (t + 1).to_string(),
                    address: format!("+1555{:07}", t + 1),
                    body: format!("Message {m} in thread {}", t + 1),
                    date: 1_700_000_000_000 + (t * per_thread + m) as Millis * 1_000,
                    kind,
                    read: m + 2 < per_thread,
                });
            }
        }
        debug!(threads, per_thread, "Seeded in-memory source");
    }

    /// Store a new unread message and notify subscribers. Returns its id.
    pub fn insert_message(&self, thread_id: &str, address: &str, body: &str, kind: MessageKind, date: Millis) -> i64 {
        let id = {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            store.next_id += 1;
            let id = store.next_id;
            store.messages.push(Message {
                id,
                thread_id: thread_id.to_string(),
                address: address.to_string(),
                body: body.to_string(),
                date,
                kind,
                read: false,
            });
            id
        };
        let root = match kind {
            MessageKind::Sms => ResourceClass::SMS_URI,
            MessageKind::Mms => ResourceClass::MMS_URI,
        };
        self.notify(RawChange::new(format!("{root}/{id}")));
        id
    }

    /// Mark every message of a thread read and notify subscribers.
    pub fn mark_thread_read(&self, thread_id: &str) {
        {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            for m in store.messages.iter_mut().filter(|m| m.thread_id == thread_id) {
                m.read = true;
            }
        }
        self.notify(RawChange::new(format!("{}/{thread_id}", ResourceClass::CONVERSATIONS_URI)));
    }

    /// Deliver a change to the subscriptions whose classes cover it.
    pub fn notify(&self, change: RawChange) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|sub| sub.sender.receiver_count() > 0);
        for sub in subscriptions.iter().filter(|sub| sub.wants(&change)) {
            // The receiver may drop between retain and send.
            let _ = sub.sender.send(change.clone());
        }
    }

    /// Number of live change subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|sub| sub.sender.receiver_count())
            .sum()
    }

    /// Make the optimized conversation query fail.
    pub fn set_fail_optimized(&self, fail: bool) {
        self.fail_optimized.store(fail, Ordering::SeqCst);
    }

    /// Make every query fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make single-thread lookups for `thread_id` fail.
    pub fn fail_thread(&self, thread_id: &str) {
        self.failing_threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread_id.to_string());
    }

    fn check_available(&self) -> Result<(), SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("store offline".into()));
        }
        Ok(())
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationQuery for InMemorySource {
    async fn latest_per_thread(&self, offset: usize, limit: usize) -> Result<Vec<ConversationSnapshot>, SourceError> {
        self.check_available()?;
        if self.fail_optimized.load(Ordering::SeqCst) {
            return Err(SourceError::Rejected("windowed union query not supported".into()));
        }
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Ok(store
            .threads_by_recency()
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| store.snapshot(id))
            .collect())
    }
}

#[async_trait]
impl ThreadQuery for InMemorySource {
    async fn list_threads(&self, offset: usize, limit: usize) -> Result<Vec<String>, SourceError> {
        self.check_available()?;
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Ok(store.threads_by_recency().into_iter().skip(offset).take(limit).collect())
    }

    async fn thread_latest(&self, thread_id: &str) -> Result<Option<ConversationSnapshot>, SourceError> {
        self.check_available()?;
        let failing = self
            .failing_threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(thread_id);
        if failing {
            return Err(SourceError::Unavailable(format!("thread {thread_id} lookup failed")));
        }
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Ok(store.snapshot(thread_id))
    }
}

#[async_trait]
impl MessageQuery for InMemorySource {
    fn supports_pagination(&self) -> bool {
        self.paginated
    }

    async fn message_page(&self, thread_id: &str, offset: usize, limit: usize) -> Result<Vec<Message>, SourceError> {
        self.check_available()?;
        if !self.paginated {
            return Err(SourceError::Rejected("paged message query not supported".into()));
        }
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Ok(store.thread(thread_id).into_iter().skip(offset).take(limit).collect())
    }

    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<Message>, SourceError> {
        self.check_available()?;
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Ok(store.thread(thread_id))
    }
}

impl ChangeFeed for InMemorySource {
    /// Each subscription gets its own channel and only sees changes under
    /// the classes it asked for.
    fn subscribe(&self, classes: &[ResourceClass]) -> Result<broadcast::Receiver<RawChange>, SourceError> {
        if classes.is_empty() {
            return Err(SourceError::Rejected("no resource classes requested".into()));
        }
        self.check_available()?;
        let (sender, receiver) = broadcast::channel(CHANGE_BUFFER);
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                classes: classes.to_vec(),
                sender,
            });
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_reflects_latest_message() {
        let source = InMemorySource::new();
        source.insert_message("7", "alice", "first", MessageKind::Sms, 10);
        source.insert_message("7", "alice", "pic", MessageKind::Mms, 20);

        let snap = source.thread_latest("7").await.unwrap().unwrap();
        assert_eq!(snap.snippet, "[MMS]");
        assert_eq!(snap.last_message_date, 20);
        assert_eq!(snap.unread_count, 2);
        assert!(!snap.is_read);

        source.mark_thread_read("7");
        let snap = source.thread_latest("7").await.unwrap().unwrap();
        assert_eq!(snap.unread_count, 0);
        assert!(snap.is_read);
    }

    #[tokio::test]
    async fn test_threads_ordered_by_recency() {
        let source = InMemorySource::new();
        source.insert_message("a", "x", "old", MessageKind::Sms, 10);
        source.insert_message("b", "y", "new", MessageKind::Sms, 30);
        source.insert_message("c", "z", "mid", MessageKind::Sms, 20);

        assert_eq!(source.list_threads(0, 10).await.unwrap(), vec!["b", "c", "a"]);
        assert_eq!(source.list_threads(1, 1).await.unwrap(), vec!["c"]);

        let snaps = source.latest_per_thread(0, 2).await.unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].thread_id, "b");
    }

    #[tokio::test]
    async fn test_insert_emits_change() {
        let source = InMemorySource::new();
        let mut rx = source.subscribe(&[ResourceClass::All]).unwrap();
        let id = source.insert_message("1", "x", "hi", MessageKind::Sms, 1);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.uri, Some(format!("content://sms/{id}")));
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let source = InMemorySource::new();
        source.seed(2, 3);
        source.set_fail_optimized(true);
        assert!(source.latest_per_thread(0, 10).await.is_err());
        assert_eq!(source.list_threads(0, 10).await.unwrap().len(), 2);

        source.fail_thread("1");
        assert!(source.thread_latest("1").await.is_err());
        assert!(source.thread_latest("2").await.unwrap().is_some());

        source.set_unavailable(true);
        assert!(source.list_threads(0, 10).await.is_err());
        assert!(source.subscribe(&[ResourceClass::Sms]).is_err());
    }

    #[test]
    fn test_subscription_sees_only_its_classes() {
        let source = InMemorySource::new();
        let mut mms = source.subscribe(&[ResourceClass::Mms]).unwrap();
        let mut all = source.subscribe(&[ResourceClass::All]).unwrap();

        source.insert_message("1", "x", "text", MessageKind::Sms, 1);
        let id = source.insert_message("1", "x", "pic", MessageKind::Mms, 2);
        source.mark_thread_read("1");
        source.notify(RawChange::new("content://contacts/1"));
        source.notify(RawChange::unspecified());

        assert_eq!(mms.try_recv().unwrap().uri, Some(format!("content://mms/{id}")));
        assert_eq!(mms.try_recv().unwrap().uri, None);
        assert!(mms.try_recv().is_err());

        let mut delivered = 0;
        while all.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 5);
    }

    #[test]
    fn test_dropped_subscriptions_are_pruned() {
        let source = InMemorySource::new();
        let rx = source.subscribe(&[ResourceClass::Sms]).unwrap();
        assert_eq!(source.subscriber_count(), 1);
        drop(rx);
        source.notify(RawChange::unspecified());
        assert_eq!(source.subscriber_count(), 0);
        assert!(source.subscriptions.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_requires_classes() {
        let source = InMemorySource::new();
        assert!(source.subscribe(&[]).is_err());
    }
}
