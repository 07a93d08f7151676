//! msg-cache-sync: runs the cache engine over an in-process message store
//! and serves the admin API.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use msg_cache_sync::config::{Cli, Config};
use msg_cache_sync::server::{build_router, AppState};
use msg_cache_sync::source::InMemorySource;
use msg_cache_sync::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "msg_cache_sync=debug,tower_http=debug"
    } else {
        "msg_cache_sync=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("msg-cache-sync v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        data_dir = %config.storage.data_dir.display(),
        memory_capacity = config.cache.memory_capacity,
        persistent_capacity = config.cache.persistent_capacity,
        ttl_secs = config.cache.ttl_secs,
        debounce_ms = config.prefetch.debounce_ms,
        "Configuration loaded"
    );

    // The in-process store stands in for the platform message provider.
    let source = Arc::new(InMemorySource::new());
    if cli.seed_threads > 0 {
        source.seed(cli.seed_threads, 30);
    }

    let listen_addr = config.server.listen.clone();
    let engine = Arc::new(Engine::open(config, source).await?);
    engine.start()?;

    let state = Arc::new(AppState::new(engine.clone())?);
    let app = build_router(state);

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown();
    Ok(())
}
