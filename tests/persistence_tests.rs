//! Persistence tests: queue, dead letters, id aliases and cache survive a
//! restart; corrupt or unavailable storage degrades gracefully.

mod common;

use common::{fast_config, note, to_doc, MockRemote};
use offline_sync::{
    KvStorage, MemoryStorage, PlatformSignal, RemoteError, SqliteStorage, SyncConfig, SyncEngine,
    SyncEvent,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open_engine(path: &Path, remote: Arc<MockRemote>, config: SyncConfig) -> SyncEngine {
    let storage = SqliteStorage::open(path).expect("Failed to open sqlite store");
    SyncEngine::builder(remote, Arc::new(storage))
        .config(config)
        .build()
        .expect("Failed to build engine")
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("sync.db");
    let remote = MockRemote::new();

    {
        let engine = open_engine(&path, remote.clone(), fast_config());
        engine.report_platform_signal(PlatformSignal::Offline);
        let created = engine.create("notes", note("persisted"));
        engine.update("notes", created.id, to_doc(json!({ "content": "edited" })));
    }

    let engine = open_engine(&path, remote.clone(), fast_config());
    let pending = engine.pending_actions();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id.as_str(), "temp_1");
    assert_eq!(pending[1].id.as_str(), "temp_2");

    // Local ids are never reissued
    engine.report_platform_signal(PlatformSignal::Offline);
    assert_eq!(engine.create("events", note("x")).id.as_str(), "temp_3");
    assert_eq!(
        engine.read("notes").get("temp_1").unwrap()["content"],
        json!("edited")
    );

    engine.report_platform_signal(PlatformSignal::Online);
    let report = engine.sync_now().await;
    assert_eq!(report.succeeded, 3);
    assert_eq!(remote.documents("notes")[0]["content"], json!("edited"));
}

#[tokio::test]
async fn test_dead_letters_and_id_aliases_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("sync.db");
    let remote = MockRemote::new();
    remote.fail_next("create", RemoteError::Validation("bad".into()));

    {
        let engine = open_engine(&path, remote.clone(), fast_config());
        engine.create("notes", note("rejected"));
        let kept = engine.create("notes", note("kept"));
        engine.sync_now().await;
        assert_eq!(kept.id.as_str(), "temp_2");
        assert_eq!(engine.dead_letters().len(), 1);
    }

    let engine = open_engine(&path, remote.clone(), fast_config());
    let letters = engine.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].action.id.as_str(), "temp_1");

    engine.update("notes", "temp_2", to_doc(json!({ "content": "again" })));
    engine.sync_now().await;
    assert_eq!(remote.calls().last().unwrap(), "update notes srv_1");
    assert!(engine.status().last_sync_at.is_some());
}

#[tokio::test]
async fn test_cache_survives_restart_and_respects_version() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("sync.db");
    let remote = MockRemote::new();
    remote.seed("notes", json!({ "id": "n1", "content": "cached" }));

    {
        let engine = open_engine(&path, remote.clone(), fast_config());
        engine.refresh("notes").await.unwrap();
    }

    let engine = open_engine(&path, remote.clone(), fast_config());
    engine.report_platform_signal(PlatformSignal::Offline);
    let view = engine.read("notes");
    assert!(view.from_cache);
    assert_eq!(view.ids(), vec!["n1"]);
    drop(engine);

    let mut config = fast_config();
    config.cache.version = "2".to_string();
    let engine = open_engine(&path, remote.clone(), config);
    engine.report_platform_signal(PlatformSignal::Offline);
    let view = engine.read("notes");
    assert!(!view.from_cache);
    assert!(view.is_empty());
}

#[tokio::test]
async fn test_corrupt_queue_entry_is_skipped() {
    let storage = Arc::new(MemoryStorage::new());
    let remote = MockRemote::new();
    let build = |storage: Arc<MemoryStorage>| {
        SyncEngine::builder(remote.clone(), storage as Arc<dyn KvStorage>)
            .config(fast_config())
            .build()
            .unwrap()
    };

    {
        let engine = build(storage.clone());
        engine.report_platform_signal(PlatformSignal::Offline);
        engine.create("notes", note("good"));
    }

    let raw = storage.get("test:queue").unwrap().unwrap();
    let mut doc: Value = serde_json::from_str(&raw).unwrap();
    doc["actions"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "garbage": true }));
    storage.put("test:queue", &doc.to_string()).unwrap();

    let engine = build(storage.clone());
    assert_eq!(engine.pending_actions().len(), 1);
    assert_eq!(engine.pending_actions()[0].id.as_str(), "temp_1");
    drop(engine);

    storage.put("test:queue", "{ not json").unwrap();
    let engine = build(storage.clone());
    assert!(engine.pending_actions().is_empty());
    assert_eq!(
        storage.get("test:queue.corrupt").unwrap().as_deref(),
        Some("{ not json")
    );
}

#[tokio::test]
async fn test_unavailable_storage_warns_once() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_unavailable(true);
    let engine = SyncEngine::builder(MockRemote::new(), storage.clone() as Arc<dyn KvStorage>)
        .config(fast_config())
        .build()
        .unwrap();
    engine.report_platform_signal(PlatformSignal::Offline);
    let mut events = engine.events();

    let first = engine.create("notes", note("one"));
    let second = engine.create("notes", note("two"));
    assert!(first.warning.is_some());
    assert!(second.warning.is_none());

    assert!(engine.status().storage_degraded);
    assert_eq!(engine.read("notes").len(), 2);

    let mut degraded = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::StorageDegraded { .. }) {
            degraded += 1;
        }
    }
    assert_eq!(degraded, 1);
}

#[test]
fn test_config_from_toml_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("sync.toml");
    std::fs::write(
        &path,
        r#"
namespace = "campus"
sync_interval_secs = 60

[retry]
max_attempts = 7

[[resources]]
key = "events"
ttl_secs = 21600
prefetch = true

[resources.filter]
organization_id = "org_1"
"#,
    )
    .unwrap();

    let config = SyncConfig::from_toml_file(&path).unwrap();
    assert_eq!(config.namespace, "campus");
    assert_eq!(config.retry.max_attempts, 7);
    assert_eq!(config.ttl_for("events").as_secs(), 21600);
    assert_eq!(
        config.filter_for("events").and_then(|f| f.get("organization_id")),
        Some(&json!("org_1"))
    );
    assert!(config.resource("events").unwrap().prefetch);
}
