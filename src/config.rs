//! Runtime configuration for msg-cache-sync.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All cache-related knobs (capacities, TTL, compression thresholds, debounce)
//! live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "msg-cache-sync", about = "Reactive cache & sync engine for a messaging client")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Admin HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Directory holding the cache databases (overrides the config file).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Seed the in-process message store with this many demo threads.
    #[arg(long, default_value_t = 0)]
    pub seed_threads: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Where the persistent tiers live.
    pub storage: StorageConfig,

    /// Tier capacities and TTL.
    pub cache: CacheConfig,

    /// Compression settings.
    pub compression: CompressionConfig,

    /// Prefetch scheduler settings.
    pub prefetch: PrefetchConfig,

    /// Conversation snapshot paging.
    pub snapshot: SnapshotConfig,

    /// Background maintenance cadence.
    pub maintenance: MaintenanceConfig,
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Persistent tier location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the SQLite files (one per cache).
    pub data_dir: PathBuf,

    /// Keep every persistent tier in memory (nothing survives a restart).
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/tmp/msg-cache-sync"),
            in_memory: false,
        }
    }
}

/// Tier capacity and expiry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries held in the memory tier.
    pub memory_capacity: usize,

    /// Maximum rows kept in the persistent tier after maintenance.
    pub persistent_capacity: usize,

    /// Persistent entries older than this are removed by maintenance.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 100,
            persistent_capacity: 10_000,
            ttl_secs: 30 * 24 * 60 * 60, // 30 days
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Compression settings for the persistent tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Payloads smaller than this are never compressed.
    pub threshold_bytes: usize,

    /// Reject compression when `compressed / original` reaches this ratio.
    pub max_ratio: f64,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024,
            max_ratio: 0.9,
            zstd_level: 3,
        }
    }
}

/// Prefetch scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Start with prefetching enabled.
    pub enabled: bool,

    /// Quiet period before a scheduled task starts running.
    pub debounce_ms: u64,

    /// Messages per page when warming older message pages.
    pub page_size: usize,

    /// Pages fetched by a single thread prefetch task.
    pub pages_per_task: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 1000,
            page_size: 20,
            pages_per_task: 3,
        }
    }
}

impl PrefetchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Conversation list paging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Default conversations per page.
    pub page_size: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

/// Periodic maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes.
    pub interval_secs: u64,

    /// Run one pass as soon as the engine starts.
    pub run_on_startup: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            run_on_startup: true,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the loaded file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(dir) = &cli.data_dir {
            self.storage.data_dir = dir.clone();
        }
    }

    /// A configuration suitable for tests: in-memory storage and a short debounce.
    pub fn ephemeral() -> Self {
        let mut config = Config::default();
        config.storage.in_memory = true;
        config.prefetch.debounce_ms = 20;
        config.maintenance.run_on_startup = false;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.memory_capacity, 100);
        assert_eq!(cfg.cache.persistent_capacity, 10_000);
        assert_eq!(cfg.cache.ttl(), Duration::from_secs(2_592_000));
        assert_eq!(cfg.compression.threshold_bytes, 1024);
        assert_eq!(cfg.prefetch.debounce(), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "cache": { "memory_capacity": 5 } }"#).unwrap();
        assert_eq!(cfg.cache.memory_capacity, 5);
        assert_eq!(cfg.cache.persistent_capacity, 10_000);
        assert_eq!(cfg.compression.max_ratio, 0.9);
        assert_eq!(cfg.snapshot.page_size, 20);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/msg-cache.json")).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:8080");
    }
}
