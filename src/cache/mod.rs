//! Tiered key/value cache.
//!
//! - [`entry`]: cache keys and persistent rows
//! - [`memory`]: bounded in-memory tier
//! - [`compressor`]: zstd framing for persisted values
//! - [`evictor`]: TTL and size maintenance policy
//! - [`tiered`]: the memory + persistent cache itself

pub mod compressor;
pub mod entry;
pub mod evictor;
pub mod memory;
pub mod tiered;

pub use entry::CacheKey;
pub use tiered::{CacheStats, SharedCache, TieredCache};
