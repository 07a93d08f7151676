//! Maintenance policy: decides which persistent entries to drop.
//!
//! Two passes, in order:
//! - TTL: entries whose timestamp is older than `now - ttl`
//! - Size: if the tier is still over capacity, the oldest entries by
//!   timestamp until it fits

use std::time::Duration;

use serde::Serialize;

use crate::cache::entry::Millis;
use crate::config::CacheConfig;

/// TTL and size bound for one persistent tier.
#[derive(Debug, Clone, Copy)]
pub struct Evictor {
    ttl: Duration,
    capacity: usize,
}

impl Evictor {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { ttl, capacity }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.persistent_capacity)
    }

    /// Entries stored strictly before this timestamp are expired.
    pub fn expiry_cutoff(&self, now: Millis) -> Millis {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(ttl_ms)
    }

    /// How many of the oldest entries must go for `count` entries to fit.
    pub fn overflow(&self, count: usize) -> usize {
        count.saturating_sub(self.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Removed by TTL.
    pub expired: usize,

    /// Removed by the size bound.
    pub trimmed: usize,

    /// Rows left in the persistent tier.
    pub remaining: usize,

    /// Keys removed by either pass; the memory tier drops them too.
    #[serde(skip)]
    pub removed_keys: Vec<String>,
}

impl MaintenanceReport {
    pub fn total_removed(&self) -> usize {
        self.expired + self.trimmed
    }

    /// Fold another cache's report into a running total.
    pub fn merge(&mut self, other: &MaintenanceReport) {
        self.expired += other.expired;
        self.trimmed += other.trimmed;
        self.remaining += other.remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_cutoff() {
        let evictor = Evictor::new(Duration::from_secs(10), 100);
        assert_eq!(evictor.expiry_cutoff(60_000), 50_000);
    }

    #[test]
    fn test_overflow() {
        let evictor = Evictor::new(Duration::from_secs(10), 100);
        assert_eq!(evictor.overflow(99), 0);
        assert_eq!(evictor.overflow(100), 0);
        assert_eq!(evictor.overflow(101), 1);
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let evictor = Evictor::new(Duration::from_secs(u64::MAX), 1);
        assert_eq!(evictor.expiry_cutoff(0), -i64::MAX);
    }

    #[test]
    fn test_report_merge() {
        let mut total = MaintenanceReport::default();
        total.merge(&MaintenanceReport {
            expired: 2,
            trimmed: 1,
            remaining: 5,
            removed_keys: vec![],
        });
        assert_eq!(total.total_removed(), 3);
        assert_eq!(total.remaining, 5);
    }
}
