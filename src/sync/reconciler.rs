//! Sync Reconciler
//!
//! Drains the action queue against the remote store. Each resource key
//! has at most one action in flight and only its head is ever dispatched;
//! different keys drain concurrently.

use super::events::{EventBus, SyncEvent};
use crate::cache::{CacheEntry, CacheStore};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::RemoteError;
use crate::ids::{LocalId, ServerId, TargetId};
use crate::queue::{ActionQueue, DeadLetter, FailOutcome, Mutation, QueuedAction};
use crate::remote::RemoteStore;
use crate::storage::{namespaced, KvStorage};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub conflicts: usize,
    /// Resource keys left waiting (backoff, dependency, connectivity)
    pub skipped_blocked: usize,
}

impl DrainReport {
    fn merge(&mut self, other: &DrainReport) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.conflicts += other.conflicts;
    }
}

/// Why the head of a sub-queue cannot be dispatched right now.
#[derive(Debug, Clone, PartialEq)]
enum Blocked {
    Offline,
    Empty,
    BackingOff,
    AwaitingVerifiedConnectivity,
    AwaitingDependency(LocalId),
}

#[derive(Debug)]
enum Head {
    Dispatch(QueuedAction),
    /// Targets a local id that nothing will ever resolve
    Orphaned(QueuedAction, LocalId),
}

#[derive(Debug, Default)]
struct RefreshGate {
    last: Option<Instant>,
    deferred: bool,
}

pub struct Reconciler {
    remote: Arc<dyn RemoteStore>,
    queue: Arc<ActionQueue>,
    cache: Arc<CacheStore>,
    connectivity: Arc<ConnectivityMonitor>,
    events: EventBus,
    config: Arc<SyncConfig>,
    storage: Arc<dyn KvStorage>,
    drain_lock: tokio::sync::Mutex<()>,
    refresh_gates: Mutex<HashMap<String, RefreshGate>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    /// Held exclusively while a settle moves an action from the queue into
    /// the cache; projections hold it shared.
    view_lock: RwLock<()>,
    retry_scheduled: Notify,
}

impl Reconciler {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        queue: Arc<ActionQueue>,
        cache: Arc<CacheStore>,
        connectivity: Arc<ConnectivityMonitor>,
        events: EventBus,
        config: Arc<SyncConfig>,
        storage: Arc<dyn KvStorage>,
    ) -> Self {
        let last_sync = load_last_sync(storage.as_ref(), &config.namespace);
        Self {
            remote,
            queue,
            cache,
            connectivity,
            events,
            config,
            storage,
            drain_lock: tokio::sync::Mutex::new(()),
            refresh_gates: Mutex::new(HashMap::new()),
            last_sync: RwLock::new(last_sync),
            view_lock: RwLock::new(()),
            retry_scheduled: Notify::new(),
        }
    }

    /// Shared guard for reading the cache and the pending queue as one
    /// consistent pair.
    pub fn view_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.view_lock.read()
    }

    /// Drain, waiting for a drain already in progress to finish first.
    pub async fn drain(&self) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        self.drain_locked().await
    }

    /// Drain unless one is already running.
    pub async fn try_drain(&self) -> Option<DrainReport> {
        let _guard = match self.drain_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Drain already in progress, skipping");
                return None;
            }
        };
        Some(self.drain_locked().await)
    }

    async fn drain_locked(&self) -> DrainReport {
        let mut report = DrainReport::default();

        loop {
            let now = Utc::now();
            let mut ready = vec![];
            let mut blocked = 0;
            for key in self.queue.resource_keys() {
                match self.check_head(&key, now) {
                    Ok(_) => ready.push(key),
                    Err(Blocked::Empty) => {}
                    Err(reason) => {
                        debug!("Sub-queue '{}' blocked: {:?}", key, reason);
                        blocked += 1;
                    }
                }
            }
            report.skipped_blocked = blocked;

            if ready.is_empty() {
                break;
            }

            let results = join_all(ready.iter().map(|key| self.drain_key(key))).await;
            for result in &results {
                report.merge(result);
            }
        }

        self.flush_deferred_refreshes().await;

        if report.dispatched > 0 {
            info!(
                "Drain finished: {} dispatched, {} succeeded, {} retried, {} dead-lettered, {} conflicts",
                report.dispatched,
                report.succeeded,
                report.retried,
                report.dead_lettered,
                report.conflicts
            );
        }
        self.events.emit(SyncEvent::DrainFinished(report.clone()));
        report
    }

    fn check_head(&self, resource_key: &str, now: DateTime<Utc>) -> Result<Head, Blocked> {
        let connectivity = self.connectivity.current();
        if !connectivity.is_online {
            return Err(Blocked::Offline);
        }

        let head = self.queue.head(resource_key).ok_or(Blocked::Empty)?;
        if head.is_backing_off(now) {
            return Err(Blocked::BackingOff);
        }
        if head.requires_strong_connectivity && !connectivity.verified {
            return Err(Blocked::AwaitingVerifiedConnectivity);
        }
        if let Some(dependency) = head.pending_dependency().cloned() {
            if self.queue.get(&dependency).is_none() {
                return Ok(Head::Orphaned(head, dependency));
            }
            return Err(Blocked::AwaitingDependency(dependency));
        }
        Ok(Head::Dispatch(head))
    }

    /// Dispatch the head of one sub-queue until it is empty or blocked.
    async fn drain_key(&self, resource_key: &str) -> DrainReport {
        let mut report = DrainReport::default();

        loop {
            let action = match self.check_head(resource_key, Utc::now()) {
                Ok(Head::Dispatch(action)) => action,
                Ok(Head::Orphaned(action, dependency)) => {
                    let reason = format!("dependency {} is no longer queued", dependency);
                    if let Some(dependents) =
                        self.queue.dead_letter(&action.id, &reason, Utc::now())
                    {
                        report.dead_lettered += 1 + dependents.len();
                        self.emit_dead_letter(&action, &reason);
                        self.emit_dependents(&dependents);
                    }
                    continue;
                }
                Err(_) => break,
            };

            debug!(
                "Dispatching {} {} on '{}' (attempt {})",
                action.kind(),
                action.id,
                resource_key,
                action.attempts + 1
            );
            report.dispatched += 1;
            let result = self.dispatch(&action).await;
            self.settle(&action, result, &mut report);
            self.refresh_after_settle(resource_key).await;
        }

        report
    }

    async fn dispatch(&self, action: &QueuedAction) -> Result<Option<ServerId>, RemoteError> {
        let key = action.resource_key.as_str();
        match &action.mutation {
            Mutation::Create { doc } => self.remote.create(key, doc).await.map(Some),
            Mutation::Update { target, .. } | Mutation::ToggleFlag { target, .. } => {
                let id = server_target(target)?;
                let patch = action.mutation.remote_patch().unwrap_or_default();
                self.remote.update(key, &id, &patch).await.map(|_| None)
            }
            Mutation::Delete { target } => {
                let id = server_target(target)?;
                self.remote.delete(key, &id).await.map(|_| None)
            }
        }
    }

    fn settle(
        &self,
        action: &QueuedAction,
        result: Result<Option<ServerId>, RemoteError>,
        report: &mut DrainReport,
    ) {
        let now = Utc::now();
        let key = action.resource_key.as_str();

        match result {
            Ok(server_id) => {
                report.succeeded += 1;
                let ttl = self.config.ttl_for(key);
                {
                    let _view = self.view_lock.write();
                    match (&action.mutation, &server_id) {
                        (Mutation::Create { .. }, Some(server)) => {
                            self.cache
                                .apply_confirmed(key, &action.mutation, Some(server), ttl);
                            self.queue.resolve_create(&action.id, server);
                            info!("Created {} on '{}' as {}", action.id, key, server);
                        }
                        _ => {
                            self.cache.apply_confirmed(key, &action.mutation, None, ttl);
                            self.queue.ack(&action.id);
                            debug!("Synced {} {} on '{}'", action.kind(), action.id, key);
                        }
                    }
                }
                self.touch_last_sync(now);
                self.events.emit(SyncEvent::ActionSynced {
                    resource_key: key.to_string(),
                    id: action.id.clone(),
                    server_id,
                });
            }
            Err(err) if err.is_retryable() => {
                match self.queue.fail(&action.id, &err.to_string(), now) {
                    Some(FailOutcome::Retry { attempt, retry_at }) => {
                        report.retried += 1;
                        self.retry_scheduled.notify_one();
                        self.events.emit(SyncEvent::RetryScheduled {
                            resource_key: key.to_string(),
                            id: action.id.clone(),
                            attempt,
                            retry_at,
                        });
                    }
                    Some(FailOutcome::DeadLettered { dependents }) => {
                        report.dead_lettered += 1 + dependents.len();
                        self.emit_dead_letter(action, &err.to_string());
                        self.emit_dependents(&dependents);
                    }
                    None => {}
                }
            }
            Err(RemoteError::Conflict(reason)) => {
                warn!(
                    "Conflict on {} {} ('{}'), dropping: {}",
                    action.kind(),
                    action.id,
                    key,
                    reason
                );
                let dependents = {
                    let _view = self.view_lock.write();
                    self.cache.invalidate(key);
                    self.queue.drop_action(&action.id, now).unwrap_or_default()
                };
                report.conflicts += 1;
                report.dead_lettered += dependents.len();
                self.events.emit(SyncEvent::Conflict {
                    resource_key: key.to_string(),
                    id: action.id.clone(),
                    reason,
                });
                self.emit_dependents(&dependents);
            }
            Err(err) => {
                let reason = err.to_string();
                if let Some(dependents) = self.queue.dead_letter(&action.id, &reason, now) {
                    report.dead_lettered += 1 + dependents.len();
                    self.emit_dead_letter(action, &reason);
                    self.emit_dependents(&dependents);
                }
            }
        }

        self.events.emit(SyncEvent::ViewChanged {
            resource_key: key.to_string(),
        });
    }

    fn emit_dead_letter(&self, action: &QueuedAction, reason: &str) {
        self.events.emit(SyncEvent::DeadLettered {
            resource_key: action.resource_key.clone(),
            id: action.id.clone(),
            reason: reason.to_string(),
        });
    }

    fn emit_dependents(&self, dependents: &[DeadLetter]) {
        for letter in dependents {
            self.emit_dead_letter(&letter.action, &letter.reason);
        }
    }

    /// Re-fetch after a settle, at most once per `refresh_min_interval` per
    /// key. A skipped refresh is deferred to the end of the drain.
    async fn refresh_after_settle(&self, resource_key: &str) {
        let refresh_now = {
            let mut gates = self.refresh_gates.lock();
            let gate = gates.entry(resource_key.to_string()).or_default();
            match gate.last {
                Some(last) if last.elapsed() < self.config.refresh_min_interval() => {
                    gate.deferred = true;
                    false
                }
                _ => {
                    gate.last = Some(Instant::now());
                    gate.deferred = false;
                    true
                }
            }
        };

        if refresh_now {
            let _ = self.refresh(resource_key).await;
        }
    }

    async fn flush_deferred_refreshes(&self) {
        let keys: Vec<String> = {
            let mut gates = self.refresh_gates.lock();
            gates
                .iter_mut()
                .filter(|(_, gate)| gate.deferred)
                .map(|(key, gate)| {
                    gate.deferred = false;
                    gate.last = Some(Instant::now());
                    key.clone()
                })
                .collect()
        };
        if keys.is_empty() {
            return;
        }
        join_all(keys.iter().map(|key| self.refresh(key))).await;
    }

    /// Fetch the authoritative list of a resource into the cache.
    pub async fn refresh(&self, resource_key: &str) -> Result<Arc<CacheEntry>, RemoteError> {
        let filter = self.config.filter_for(resource_key);
        match self.remote.list(resource_key, filter).await {
            Ok(items) => {
                let now = Utc::now();
                let entry =
                    self.cache
                        .put(resource_key, items, self.config.ttl_for(resource_key), now);
                self.touch_last_sync(now);
                self.events.emit(SyncEvent::ViewChanged {
                    resource_key: resource_key.to_string(),
                });
                Ok(entry)
            }
            Err(e) => {
                self.cache.release_revalidation(resource_key);
                warn!("Failed to refresh '{}': {}", resource_key, e);
                Err(e)
            }
        }
    }

    /// Refresh every resource configured with `prefetch`.
    pub async fn prefetch(&self) {
        let keys: Vec<&str> = self
            .config
            .resources
            .iter()
            .filter(|r| r.prefetch)
            .map(|r| r.key.as_str())
            .collect();
        if keys.is_empty() {
            return;
        }
        debug!("Prefetching {:?}", keys);
        join_all(keys.iter().map(|key| self.refresh(key))).await;
    }

    /// Earliest pending backoff deadline, if any.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.queue.next_retry_at(Utc::now())
    }

    /// Resolves once a failed action has been given a new retry time.
    pub async fn retry_scheduled(&self) {
        self.retry_scheduled.notified().await
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    fn touch_last_sync(&self, now: DateTime<Utc>) {
        *self.last_sync.write() = Some(now);
        let key = namespaced(&self.config.namespace, "last_sync");
        if let Err(e) = self.storage.put(&key, &now.to_rfc3339()) {
            debug!("Could not persist last sync time: {}", e);
        }
    }

    pub fn clear_last_sync(&self) {
        *self.last_sync.write() = None;
        let key = namespaced(&self.config.namespace, "last_sync");
        if let Err(e) = self.storage.delete(&key) {
            error!("Failed to clear last sync time: {}", e);
        }
    }
}

fn server_target(target: &TargetId) -> Result<ServerId, RemoteError> {
    match target {
        TargetId::Server(id) => Ok(id.clone()),
        TargetId::Local(id) => Err(RemoteError::Validation(format!(
            "target {} has no server id yet",
            id
        ))),
    }
}

/// Read the persisted last sync time.
pub fn load_last_sync(storage: &dyn KvStorage, namespace: &str) -> Option<DateTime<Utc>> {
    let raw = storage
        .get(&namespaced(namespace, "last_sync"))
        .ok()
        .flatten()?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectivityConfig;
    use crate::queue::RetryPolicy;
    use crate::remote::{Document, ListFilter};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteStore for Recorder {
        async fn create(&self, key: &str, _doc: &Document) -> Result<ServerId, RemoteError> {
            let mut calls = self.calls.lock();
            calls.push(format!("create {}", key));
            Ok(ServerId::new(format!("srv_{}", calls.len())))
        }

        async fn update(
            &self,
            key: &str,
            id: &ServerId,
            _patch: &Document,
        ) -> Result<(), RemoteError> {
            self.calls.lock().push(format!("update {} {}", key, id));
            Ok(())
        }

        async fn delete(&self, key: &str, id: &ServerId) -> Result<(), RemoteError> {
            self.calls.lock().push(format!("delete {} {}", key, id));
            Ok(())
        }

        async fn list(
            &self,
            _key: &str,
            _filter: Option<&ListFilter>,
        ) -> Result<Vec<Document>, RemoteError> {
            Ok(vec![])
        }
    }

    fn reconciler(remote: Arc<Recorder>) -> (Reconciler, Arc<ActionQueue>, Arc<ConnectivityMonitor>) {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let config = Arc::new(SyncConfig::default());
        let events = EventBus::default();
        let queue = Arc::new(ActionQueue::load(
            storage.clone(),
            "test",
            RetryPolicy::default(),
        ));
        let cache = Arc::new(CacheStore::load(
            storage.clone(),
            "test",
            "id",
            &config.cache,
        ));
        let connectivity = Arc::new(ConnectivityMonitor::new(
            &ConnectivityConfig::default(),
            false,
            events.clone(),
        ));
        let reconciler = Reconciler::new(
            remote,
            queue.clone(),
            cache,
            connectivity.clone(),
            events,
            config,
            storage,
        );
        (reconciler, queue, connectivity)
    }

    #[tokio::test]
    async fn test_offline_drain_dispatches_nothing() {
        let remote = Arc::new(Recorder::default());
        let (reconciler, queue, connectivity) = reconciler(remote.clone());
        connectivity.report(crate::connectivity::PlatformSignal::Offline);
        queue.enqueue(
            "notes",
            Mutation::Create {
                doc: json!({"a": 1}).as_object().cloned().unwrap(),
            },
            false,
            Utc::now(),
        );

        let report = reconciler.drain().await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped_blocked, 1);
        assert!(remote.calls.lock().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_strong_action_waits_for_verified_state() {
        let remote = Arc::new(Recorder::default());
        let (reconciler, queue, connectivity) = reconciler(remote.clone());
        queue.enqueue(
            "payments",
            Mutation::Delete {
                target: TargetId::from("p1"),
            },
            true,
            Utc::now(),
        );

        // Startup state is online but unverified
        let report = reconciler.drain().await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped_blocked, 1);

        connectivity.record_probe(true);
        let report = reconciler.drain().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(*remote.calls.lock(), vec!["delete payments p1"]);
        assert!(reconciler.last_sync().is_some());
    }

    #[tokio::test]
    async fn test_orphaned_dependency_is_dead_lettered() {
        let remote = Arc::new(Recorder::default());
        let (reconciler, queue, _) = reconciler(remote.clone());
        queue.enqueue(
            "notes",
            Mutation::Delete {
                target: TargetId::from("temp_99"),
            },
            false,
            Utc::now(),
        );

        let report = reconciler.drain().await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.dispatched, 0);
        assert!(queue.is_empty());
        assert!(remote.calls.lock().is_empty());
    }
}
