//! Keeping caches in step with the external store.
//!
//! - [`notifier`]: change classification, invalidation and listener fan-out
//! - [`scheduler`]: debounced, cancellable background prefetch
//! - [`pages`]: message page cache and the older-pages prefetch task

pub mod notifier;
pub mod pages;
pub mod scheduler;

pub use notifier::{
    ChangeEvent, ChangeKind, ChangeListener, ChangeNotifier, NotifierError, ResyncScheduler,
    ThreadInvalidation,
};
pub use pages::{MessagePages, PageWindow, PrefetchOutcome, StopReason};
pub use scheduler::{PrefetchScheduler, PrefetchState, SchedulerError};
