//! Common test utilities for sync engine tests
//!
//! Provides shared helpers for:
//! - An in-memory remote store with scripted ids, failure injection and a call log
//! - A scripted reachability probe
//! - Building engines with fast retry settings

#![allow(dead_code)]

use async_trait::async_trait;
use offline_sync::{
    Document, KvStorage, ListFilter, MemoryStorage, Reachability, RemoteError, RemoteStore,
    ServerId, SyncConfig, SyncEngine,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Remote store backed by a map of collections.
///
/// Created documents get `srv_<n>` ids unless ids were scripted with
/// [`MockRemote::script_ids`]. Failures queued with [`MockRemote::fail_next`]
/// are consumed in order, per operation.
#[derive(Default)]
pub struct MockRemote {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    next_id: AtomicUsize,
    scripted_ids: Mutex<VecDeque<String>>,
    failures: Mutex<HashMap<&'static str, VecDeque<RemoteError>>>,
    calls: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
    list_delay: Mutex<Option<Duration>>,
    create_delay: Mutex<Option<Duration>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_ids(&self, ids: &[&str]) {
        self.scripted_ids
            .lock()
            .extend(ids.iter().map(|id| id.to_string()));
    }

    /// Fail the next call of `op` ("create", "update", "delete" or "list").
    pub fn fail_next(&self, op: &'static str, err: RemoteError) {
        self.failures.lock().entry(op).or_default().push_back(err);
    }

    pub fn fail_times(&self, op: &'static str, times: usize, err: RemoteError) {
        for _ in 0..times {
            self.fail_next(op, err.clone());
        }
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock() = Some(delay);
    }

    /// Hold every create for `delay` after it has been logged.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    /// Put a document straight into the remote collection.
    pub fn seed(&self, collection: &str, doc: Value) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(to_doc(doc));
    }

    /// Mutating calls, e.g. `"create notes"`, `"update notes srv_1"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn take_failure(&self, op: &'static str) -> Result<(), RemoteError> {
        match self.failures.lock().get_mut(op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn create(&self, collection: &str, doc: &Document) -> Result<ServerId, RemoteError> {
        self.calls.lock().push(format!("create {}", collection));
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.take_failure("create")?;

        let id = match self.scripted_ids.lock().pop_front() {
            Some(id) => id,
            None => format!("srv_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
        };
        let mut stored = doc.clone();
        stored.insert("id".to_string(), Value::String(id.clone()));
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(stored);
        Ok(ServerId::new(id))
    }

    async fn update(
        &self,
        collection: &str,
        id: &ServerId,
        patch: &Document,
    ) -> Result<(), RemoteError> {
        self.calls.lock().push(format!("update {} {}", collection, id));
        self.take_failure("update")?;

        let mut collections = self.collections.lock();
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| {
                docs.iter_mut()
                    .find(|d| d.get("id").and_then(Value::as_str) == Some(id.as_str()))
            })
            .ok_or_else(|| RemoteError::Conflict(format!("{} not found", id)))?;
        for (field, value) in patch {
            doc.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &ServerId) -> Result<(), RemoteError> {
        self.calls.lock().push(format!("delete {} {}", collection, id));
        self.take_failure("delete")?;

        if let Some(docs) = self.collections.lock().get_mut(collection) {
            docs.retain(|d| d.get("id").and_then(Value::as_str) != Some(id.as_str()));
        }
        Ok(())
    }

    async fn list(
        &self,
        collection: &str,
        filter: Option<&ListFilter>,
    ) -> Result<Vec<Document>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.take_failure("list")?;

        Ok(self
            .documents(collection)
            .into_iter()
            .filter(|doc| filter.map_or(true, |f| f.matches(doc)))
            .collect())
    }
}

/// Probe whose answer is flipped by the test.
pub struct ScriptedProbe {
    reachable: AtomicBool,
    probes: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reachability for ScriptedProbe {
    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

pub fn to_doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

pub fn note(content: &str) -> Document {
    to_doc(json!({ "content": content, "done": false }))
}

/// Config with short backoff and no jitter so retries can be driven from
/// a test.
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.namespace = "test".to_string();
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 100;
    config.retry.jitter = 0.0;
    config.refresh_min_interval_ms = 0;
    config
}

pub fn create_engine(remote: Arc<MockRemote>) -> (SyncEngine, Arc<MemoryStorage>) {
    create_engine_with(remote, fast_config())
}

pub fn create_engine_with(
    remote: Arc<MockRemote>,
    config: SyncConfig,
) -> (SyncEngine, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let engine = SyncEngine::builder(remote, storage.clone() as Arc<dyn KvStorage>)
        .config(config)
        .build()
        .expect("Failed to build engine");
    (engine, storage)
}

/// Let backoff timers elapse between drains.
pub async fn wait_for_backoff() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
