//! Cache and revalidation tests

mod common;

use common::{create_engine, create_engine_with, fast_config, MockRemote};
use offline_sync::{ListFilter, PlatformSignal, RemoteError, ResourceConfig, SyncError};
use serde_json::json;
use std::time::Duration;

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_expired_entry_revalidates_once() {
    let remote = MockRemote::new();
    remote.seed("notes", json!({ "id": "n1", "content": "a" }));
    remote.set_list_delay(Duration::from_millis(100));
    let mut config = fast_config();
    config.cache.default_ttl_secs = 0;
    let (engine, _storage) = create_engine_with(remote.clone(), config);
    engine.start();

    for _ in 0..5 {
        let view = engine.read("notes");
        assert!(view.is_empty());
        assert!(view.stale);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(remote.list_calls(), 1);

    // Served even though it is already expired again
    let view = engine.read("notes");
    assert_eq!(view.ids(), vec!["n1"]);
    assert!(view.from_cache);
    assert!(view.stale);

    engine.stop().await;
}

#[tokio::test]
async fn test_fresh_entry_is_not_refetched() {
    let remote = MockRemote::new();
    remote.seed("notes", json!({ "id": "n1", "content": "a" }));
    let (engine, _storage) = create_engine(remote.clone());
    engine.start();

    let view = engine.refresh("notes").await.unwrap();
    assert_eq!(view.ids(), vec!["n1"]);
    assert!(!view.stale);

    for _ in 0..3 {
        engine.read("notes");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.list_calls(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_stale_cache_served_offline_without_fetch() {
    let remote = MockRemote::new();
    remote.seed("notes", json!({ "id": "n1", "content": "cached" }));
    let mut config = fast_config();
    config.cache.default_ttl_secs = 0;
    let (engine, _storage) = create_engine_with(remote.clone(), config);
    engine.start();

    engine.refresh("notes").await.unwrap();
    engine.report_platform_signal(PlatformSignal::Offline);

    let view = engine.read("notes");
    assert_eq!(view.ids(), vec!["n1"]);
    assert_eq!(view.get("n1").unwrap()["content"], json!("cached"));
    assert!(view.stale);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.list_calls(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_snapshot() {
    let remote = MockRemote::new();
    remote.seed("notes", json!({ "id": "n1", "content": "a" }));
    let (engine, _storage) = create_engine(remote.clone());

    engine.refresh("notes").await.unwrap();
    remote.fail_next("list", RemoteError::Transient("503".into()));
    remote.seed("notes", json!({ "id": "n2", "content": "b" }));

    let err = engine.refresh("notes").await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(RemoteError::Transient(_))));
    assert_eq!(engine.read("notes").ids(), vec!["n1"]);

    let view = engine.refresh("notes").await.unwrap();
    assert_eq!(view.ids(), vec!["n1", "n2"]);
}

#[tokio::test]
async fn test_resource_filter_applied_to_list() {
    let remote = MockRemote::new();
    remote.seed("events", json!({ "id": "e1", "org": "acme" }));
    remote.seed("events", json!({ "id": "e2", "org": "globex" }));
    let mut config = fast_config();
    config.resources.push(
        ResourceConfig::new("events")
            .with_ttl_secs(6 * 3600)
            .with_filter(ListFilter::new().field_eq("org", "acme")),
    );
    let (engine, _storage) = create_engine_with(remote.clone(), config);

    let view = engine.refresh("events").await.unwrap();
    assert_eq!(view.ids(), vec!["e1"]);
    assert!(!view.stale);
}

#[tokio::test]
async fn test_prefetch_after_reconnect() {
    let remote = MockRemote::new();
    remote.seed("announcements", json!({ "id": "a1", "title": "hello" }));
    let mut config = fast_config();
    config
        .resources
        .push(ResourceConfig::new("announcements").prefetch());
    let (engine, _storage) = create_engine_with(remote.clone(), config);
    engine.start();

    engine.report_platform_signal(PlatformSignal::Offline);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(remote.list_calls(), 0);

    engine.report_platform_signal(PlatformSignal::Online);
    wait_until(|| remote.list_calls() > 0).await;
    assert_eq!(remote.list_calls(), 1);
    assert_eq!(engine.view("announcements").ids(), vec!["a1"]);

    engine.stop().await;
}

#[tokio::test]
async fn test_status_reports_cache_size_and_clear_all() {
    let remote = MockRemote::new();
    remote.seed("notes", json!({ "id": "n1", "content": "a" }));
    let (engine, _storage) = create_engine(remote.clone());

    engine.refresh("notes").await.unwrap();
    let status = engine.status();
    assert_eq!(status.cache_entries, 1);
    assert!(status.cache_size_bytes > 0);
    assert!(status.cache_size.ends_with("KB"));
    assert!(status.last_sync_at.is_some());

    let mut sub = engine.subscribe("notes");
    engine.clear_all();
    assert!(sub.try_recv().is_some());
    let status = engine.status();
    assert_eq!(status.cache_entries, 0);
    assert!(status.last_sync_at.is_none());
    assert!(engine.read("notes").is_empty());
}
