//! Admin API over a real listener.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;

use msg_cache_sync::config::Config;
use msg_cache_sync::server::admin_api::HealthResponse;
use msg_cache_sync::server::{build_router, AppState};
use msg_cache_sync::source::InMemorySource;
use msg_cache_sync::Engine;

async fn serve(source: Arc<InMemorySource>) -> (SocketAddr, Arc<Engine>) {
    let engine = Arc::new(Engine::open(Config::ephemeral(), source).await.unwrap());
    let state = Arc::new(AppState::new(engine.clone()).unwrap());
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, engine)
}

fn seeded(threads: usize, per_thread: usize) -> Arc<InMemorySource> {
    let source = InMemorySource::new();
    source.seed(threads, per_thread);
    Arc::new(source)
}

#[tokio::test]
async fn test_health() {
    let (addr, engine) = serve(seeded(0, 0)).await;
    engine.start().unwrap();

    let health: HealthResponse = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health.status, "ok");
    assert!(health.notifier_registered);
    assert!(health.prefetch_enabled);
    engine.shutdown();
}

#[tokio::test]
async fn test_conversations_page() {
    let (addr, engine) = serve(seeded(8, 2)).await;

    let page: Value = reqwest::get(format!("http://{addr}/v1/conversations?limit=5"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let snapshots = page["snapshots"].as_array().unwrap();
    assert_eq!(snapshots.len(), 5);
    assert_eq!(snapshots[0]["thread_id"], "8");
    assert_eq!(page["has_more"], true);
    assert_eq!(page["source"], "optimized");
    engine.shutdown();
}

#[tokio::test]
async fn test_unavailable_source_is_bad_gateway() {
    let source = seeded(3, 1);
    let (addr, engine) = serve(source.clone()).await;
    source.set_unavailable(true);

    let response = reqwest::get(format!("http://{addr}/v1/conversations"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);

    let response = reqwest::get(format!("http://{addr}/v1/threads/1/messages"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    engine.shutdown();
}

#[tokio::test]
async fn test_thread_messages() {
    let (addr, engine) = serve(seeded(2, 4)).await;

    let messages: Vec<Value> = reqwest::get(format!("http://{addr}/v1/threads/2/messages?page=0"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(messages.len(), 4);
    assert!(messages.iter().all(|m| m["thread_id"] == "2"));
    assert!(engine.pages().contains("2", 0).await);
    engine.shutdown();
}

#[tokio::test]
async fn test_stats_maintenance_and_metrics() {
    let (addr, engine) = serve(seeded(4, 1)).await;
    let client = reqwest::Client::new();

    client
        .get(format!("http://{addr}/v1/conversations?limit=10"))
        .send()
        .await
        .unwrap();

    let stats: Value = client
        .get(format!("http://{addr}/v1/cache/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["conversations"]["persistent_entries"], 4);

    let report: Value = client
        .post(format!("http://{addr}/v1/cache/maintenance"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["expired"], 0);
    assert_eq!(report["trimmed"], 0);
    assert_eq!(report["remaining"], 4);

    let body = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("msg_cache_persistent_entries{cache=\"conversations\"} 4"));
    assert!(body.contains("msg_prefetch_tracked"));
    engine.shutdown();
}
