//! Prometheus gauges for the engine.
//!
//! Gauges are refreshed from [`EngineStats`] on every scrape, so there is no
//! instrumentation on the cache hot path.

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::CacheStats;
use crate::engine::EngineStats;

pub struct EngineMetrics {
    registry: Registry,
    cache_hits: IntGaugeVec,
    cache_misses: IntGaugeVec,
    memory_entries: IntGaugeVec,
    persistent_entries: IntGaugeVec,
    prefetch_tracked: IntGauge,
    prefetch_completed: IntGauge,
    listeners: IntGauge,
    change_events: IntGauge,
    listener_failures: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let per_cache = |name: &str, help: &str| -> Result<IntGaugeVec, prometheus::Error> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["cache"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let cache_hits = per_cache("msg_cache_hits", "Cache hits since last clear")?;
        let cache_misses = per_cache("msg_cache_misses", "Cache misses since last clear")?;
        let memory_entries = per_cache("msg_cache_memory_entries", "Entries in the memory tier")?;
        let persistent_entries = per_cache("msg_cache_persistent_entries", "Entries in the persistent tier")?;

        let single = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let prefetch_tracked = single("msg_prefetch_tracked", "Prefetch tasks pending or running")?;
        let prefetch_completed = single("msg_prefetch_completed", "Prefetch tasks finished")?;
        let listeners = single("msg_change_listeners", "Registered change listeners")?;
        let change_events = single("msg_change_events", "Change events handled")?;
        let listener_failures = single("msg_change_listener_failures", "Change listener callbacks that failed")?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            memory_entries,
            persistent_entries,
            prefetch_tracked,
            prefetch_completed,
            listeners,
            change_events,
            listener_failures,
        })
    }

    fn observe_cache(&self, name: &str, stats: &CacheStats) {
        self.cache_hits.with_label_values(&[name]).set(stats.hits as i64);
        self.cache_misses.with_label_values(&[name]).set(stats.misses as i64);
        self.memory_entries
            .with_label_values(&[name])
            .set(stats.memory_entries as i64);
        self.persistent_entries
            .with_label_values(&[name])
            .set(stats.persistent_entries as i64);
    }

    pub fn observe(&self, stats: &EngineStats) {
        self.observe_cache("translations", &stats.translations);
        self.observe_cache("conversations", &stats.conversations);
        self.observe_cache("messages", &stats.messages);
        self.prefetch_tracked.set(stats.prefetch.tracked as i64);
        self.prefetch_completed.set(stats.prefetch.completed as i64);
        self.listeners.set(stats.notifier.listeners as i64);
        self.change_events.set(stats.notifier.events_handled as i64);
        self.listener_failures.set(stats.notifier.listener_failures as i64);
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_cache_labels() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.observe_cache(
            "translations",
            &CacheStats {
                hits: 7,
                ..Default::default()
            },
        );
        let text = metrics.render().unwrap();
        assert!(text.contains("msg_cache_hits{cache=\"translations\"} 7"));
    }
}
