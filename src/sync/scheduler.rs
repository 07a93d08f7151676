//! Debounced background prefetch.
//!
//! At most one task per key is pending or running at any time. A scheduled
//! task waits out the debounce delay, then runs on the single background
//! worker. Work functions get a [`CancellationToken`] and are expected to
//! check it between units of work.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PrefetchConfig;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Prefetch scheduler needs a tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchState {
    /// Waiting out the debounce delay or queued for the worker.
    Pending,
    Running,
}

struct TaskRecord {
    id: Uuid,
    state: PrefetchState,
    token: CancellationToken,
    started_at: Instant,
}

type WorkFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Work = Box<dyn FnOnce(CancellationToken) -> WorkFuture + Send>;

struct Queued {
    key: String,
    id: Uuid,
    token: CancellationToken,
    work: Work,
}

struct Inner {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    enabled: AtomicBool,
    debounce: Duration,
    queue: mpsc::UnboundedSender<Queued>,
    completed: AtomicU64,
}

impl Inner {
    /// Drop the record for `key` if it still belongs to task `id`.
    fn finish(&self, key: &str, id: Uuid) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.get(key).is_some_and(|record| record.id == id) {
            tasks.remove(key);
        }
    }

    /// Mark task `id` running. Returns `false` if it was cancelled meanwhile.
    fn start(&self, key: &str, id: Uuid) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.get_mut(key) {
            Some(record) if record.id == id && !record.token.is_cancelled() => {
                record.state = PrefetchState::Running;
                true
            }
            _ => false,
        }
    }

    async fn run(&self, queued: Queued) {
        let Queued { key, id, token, work } = queued;
        if !self.start(&key, id) {
            debug!(key = %key, "Prefetch task cancelled before start");
            self.finish(&key, id);
            return;
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(work(token.clone())).catch_unwind().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(())) if token.is_cancelled() => {
                debug!(key = %key, elapsed_ms, "Prefetch task stopped early")
            }
            Ok(Ok(())) => debug!(key = %key, elapsed_ms, "Prefetch task finished"),
            Ok(Err(e)) => warn!(key = %key, elapsed_ms, error = %e, "Prefetch task failed"),
            Err(_) => warn!(key = %key, elapsed_ms, "Prefetch task panicked"),
        }

        self.completed.fetch_add(1, Ordering::Relaxed);
        self.finish(&key, id);
    }
}

/// Per-key debounced task runner with one background worker.
pub struct PrefetchScheduler {
    inner: Arc<Inner>,
    handle: Handle,
    shutdown: CancellationToken,
}

impl PrefetchScheduler {
    /// Create the scheduler and start its worker on the current runtime.
    pub fn new(config: &PrefetchConfig) -> Result<Self, SchedulerError> {
        let handle = Handle::try_current()?;
        let (queue, mut rx) = mpsc::unbounded_channel::<Queued>();
        let inner = Arc::new(Inner {
            tasks: Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(config.enabled),
            debounce: config.debounce(),
            queue,
            completed: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        let worker = Arc::clone(&inner);
        let stop = shutdown.clone();
        handle.spawn(async move {
            loop {
                let queued = tokio::select! {
                    _ = stop.cancelled() => break,
                    queued = rx.recv() => match queued {
                        Some(queued) => queued,
                        None => break,
                    },
                };
                worker.run(queued).await;
            }
            debug!("Prefetch worker stopped");
        });

        Ok(Self {
            inner,
            handle,
            shutdown,
        })
    }

    /// Schedule `work` under `key`.
    ///
    /// Returns `false` without doing anything if the scheduler is disabled or
    /// shut down, or a task for `key` is already pending or running.
    pub fn schedule<F, Fut>(&self, key: impl Into<String>, work: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = key.into();
        if self.shutdown.is_cancelled() {
            debug!(key = %key, "Prefetch scheduler shut down, ignoring request");
            return false;
        }
        if !self.is_enabled() {
            debug!(key = %key, "Prefetch disabled, ignoring request");
            return false;
        }

        let id = Uuid::new_v4();
        let token = self.shutdown.child_token();
        {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = tasks.get(&key) {
                debug!(
                    key = %key,
                    state = ?existing.state,
                    age_ms = existing.started_at.elapsed().as_millis() as u64,
                    "Prefetch already scheduled"
                );
                return false;
            }
            tasks.insert(
                key.clone(),
                TaskRecord {
                    id,
                    state: PrefetchState::Pending,
                    token: token.clone(),
                    started_at: Instant::now(),
                },
            );
        }

        let work: Work = Box::new(move |token| -> WorkFuture { Box::pin(work(token)) });
        let inner = Arc::clone(&self.inner);
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    inner.finish(&key, id);
                    return;
                }
                _ = tokio::time::sleep(inner.debounce) => {}
            }
            let queued = Queued {
                key: key.clone(),
                id,
                token,
                work,
            };
            if inner.queue.send(queued).is_err() {
                inner.finish(&key, id);
            }
        });

        debug!(id = %id, "Prefetch scheduled");
        true
    }

    /// Cancel the task for `key`. A running task stops at its next checkpoint.
    pub fn cancel(&self, key: &str) -> bool {
        let record = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match record {
            Some(record) => {
                record.token.cancel();
                debug!(
                    key,
                    state = ?record.state,
                    age_ms = record.started_at.elapsed().as_millis() as u64,
                    "Prefetch cancelled"
                );
                true
            }
            None => false,
        }
    }

    /// Enable or disable prefetching. Disabling cancels every tracked task.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("Prefetch enabled");
            return;
        }

        let drained: Vec<TaskRecord> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, record)| record)
            .collect();
        for record in &drained {
            record.token.cancel();
        }
        info!(cancelled = drained.len(), "Prefetch disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self, key: &str) -> Option<PrefetchState> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|record| record.state)
    }

    /// Number of pending or running tasks.
    pub fn tracked(&self) -> usize {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Tasks that ran to completion, failed or stopped early.
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Stop the worker and cancel everything in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler(debounce_ms: u64) -> PrefetchScheduler {
        PrefetchScheduler::new(&PrefetchConfig {
            debounce_ms,
            ..Default::default()
        })
        .unwrap()
    }

    async fn wait_idle(scheduler: &PrefetchScheduler) {
        for _ in 0..200 {
            if scheduler.tracked() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scheduler never went idle");
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce(CancellationToken) -> futures::future::Ready<anyhow::Result<()>> {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_duplicate_schedule_runs_once() {
        let scheduler = scheduler(20);
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule("t1", counting(&runs)));
        assert!(!scheduler.schedule("t1", counting(&runs)));
        assert_eq!(scheduler.state("t1"), Some(PrefetchState::Pending));

        wait_idle(&scheduler).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.completed(), 1);

        // Key is free again once the task completes.
        assert!(scheduler.schedule("t1", counting(&runs)));
        wait_idle(&scheduler).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_debounce() {
        let scheduler = scheduler(50);
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("t1", counting(&runs));
        assert!(scheduler.cancel("t1"));
        assert!(!scheduler.cancel("t1"));
        assert_eq!(scheduler.state("t1"), None);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_task_stops_at_checkpoint() {
        let scheduler = scheduler(1);
        let units = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&units);

        scheduler.schedule("t1", move |token| async move {
            for _ in 0..1_000 {
                if token.is_cancelled() {
                    break;
                }
                counted.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            anyhow::Ok(())
        });

        for _ in 0..200 {
            if scheduler.state("t1") == Some(PrefetchState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(scheduler.cancel("t1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_cancel = units.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(units.load(Ordering::SeqCst), after_cancel);
        assert!(after_cancel < 1_000);
    }

    #[tokio::test]
    async fn test_disable_clears_and_suppresses() {
        let scheduler = scheduler(50);
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("a", counting(&runs));
        scheduler.schedule("b", counting(&runs));
        assert_eq!(scheduler.tracked(), 2);

        scheduler.set_enabled(false);
        assert_eq!(scheduler.tracked(), 0);
        assert!(!scheduler.schedule("c", counting(&runs)));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        scheduler.set_enabled(true);
        assert!(scheduler.schedule("c", counting(&runs)));
        wait_idle(&scheduler).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_work_free_the_key() {
        let scheduler = scheduler(1);

        scheduler.schedule("t1", |_| async { Err::<(), _>(anyhow::anyhow!("source offline")) });
        wait_idle(&scheduler).await;

        let explode = true;
        scheduler.schedule("t1", move |_| async move {
            if explode {
                panic!("boom");
            }
            anyhow::Ok(())
        });
        wait_idle(&scheduler).await;

        let runs = Arc::new(AtomicUsize::new(0));
        assert!(scheduler.schedule("t1", counting(&runs)));
        wait_idle(&scheduler).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_is_rejected() {
        let scheduler = scheduler(10);
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.shutdown();

        assert!(!scheduler.schedule("t1", counting(&runs)));
        assert_eq!(scheduler.tracked(), 0);
        assert_eq!(scheduler.state("t1"), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
