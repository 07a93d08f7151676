//! msg-cache-sync: reactive cache & synchronization engine for a messaging client.
//!
//! Keeps application caches consistent with an externally mutated message
//! store while hiding its latency:
//!   memory tier → SQLite tier (zstd for large values)
//!   change feed → invalidation → debounced resync and prefetch

pub mod cache;
pub mod config;
pub mod engine;
pub mod server;
pub mod snapshot;
pub mod source;
pub mod storage;
pub mod sync;

pub use engine::{Engine, EngineError, EngineStats};
