//! Sync Facade
//!
//! [`SyncEngine`] is the surface feature code talks to. It owns the queue,
//! the cache, the connectivity monitor and the reconciler; every instance is
//! built explicitly from injected collaborators, so two engines never share
//! state.
//!
//! ```rust,ignore
//! let engine = SyncEngine::builder(remote, storage)
//!     .config(config)
//!     .probe(Arc::new(HttpProbe::new("https://app.example/version.json", timeout)?))
//!     .build()?;
//! engine.start();
//!
//! let receipt = engine.create("notes", doc);
//! let view = engine.read("notes"); // includes receipt.id immediately
//! ```

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, PlatformSignal, Reachability};
use crate::error::{SyncError, SyncResult};
use crate::ids::{LocalId, TargetId};
use crate::projector::{self, item_id, EffectiveView};
use crate::queue::{ActionQueue, DeadLetter, Enqueued, Mutation, QueuedAction, RetryPolicy};
use crate::remote::{Document, RemoteStore};
use crate::storage::KvStorage;
use crate::sync::{
    create_command_channel, DrainReport, EventBus, Reconciler, ResourceSubscription,
    SyncCommand, SyncEvent, SyncWorker,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshot returned by [`SyncEngine::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub connectivity: ConnectivityState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub queued_actions: usize,
    pub dead_letters: usize,
    pub cache_entries: usize,
    pub cache_size_bytes: usize,
    /// Human readable cache size, e.g. `"12 KB"`
    pub cache_size: String,
    pub storage_degraded: bool,
}

pub struct SyncEngineBuilder {
    remote: Arc<dyn RemoteStore>,
    storage: Arc<dyn KvStorage>,
    config: SyncConfig,
    probe: Option<Arc<dyn Reachability>>,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Reachability probe used to verify platform signals.
    pub fn probe(mut self, probe: Arc<dyn Reachability>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let events = EventBus::default();

        let queue = Arc::new(ActionQueue::load(
            self.storage.clone(),
            &config.namespace,
            RetryPolicy::from_config(&config.retry),
        ));
        let cache = Arc::new(CacheStore::load(
            self.storage.clone(),
            &config.namespace,
            &config.id_field,
            &config.cache,
        ));
        let connectivity = Arc::new(ConnectivityMonitor::new(
            &config.connectivity,
            self.probe.is_some(),
            events.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            self.remote,
            queue.clone(),
            cache.clone(),
            connectivity.clone(),
            events.clone(),
            config.clone(),
            self.storage,
        ));

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                config,
                queue,
                cache,
                connectivity,
                reconciler,
                events,
                probe: self.probe,
                running: Mutex::new(None),
            }),
        })
    }
}

struct Running {
    command_tx: mpsc::Sender<SyncCommand>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct EngineInner {
    config: Arc<SyncConfig>,
    queue: Arc<ActionQueue>,
    cache: Arc<CacheStore>,
    connectivity: Arc<ConnectivityMonitor>,
    reconciler: Arc<Reconciler>,
    events: EventBus,
    probe: Option<Arc<dyn Reachability>>,
    running: Mutex<Option<Running>>,
}

/// Offline-first sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder(remote: Arc<dyn RemoteStore>, storage: Arc<dyn KvStorage>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            remote,
            storage,
            config: SyncConfig::default(),
            probe: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Spawn the background worker and, when a probe is configured, the
    /// connectivity probe loop. Must be called inside a tokio runtime.
    /// Calling it twice is a no-op.
    pub fn start(&self) {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return;
        }

        let (command_tx, command_rx) = create_command_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = SyncWorker::new(
            self.inner.reconciler.clone(),
            command_rx,
            self.inner.connectivity.subscribe(),
            self.inner.config.sync_interval(),
        );
        let mut handles = vec![tokio::spawn(worker.run())];

        if let Some(probe) = &self.inner.probe {
            let monitor = self.inner.connectivity.clone();
            handles.push(tokio::spawn(monitor.run(
                probe.clone(),
                self.inner.config.connectivity.probe_interval(),
                shutdown_rx,
            )));
        }

        *running = Some(Running {
            command_tx,
            shutdown_tx,
            handles,
        });
        info!("Sync engine started");
    }

    /// Stop background tasks. An in-flight remote call is allowed to finish.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.command_tx.send(SyncCommand::Shutdown).await;
        let _ = running.shutdown_tx.send(true);
        for handle in running.handles {
            let _ = handle.await;
        }
        info!("Sync engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    fn send(&self, command: SyncCommand) -> bool {
        match self.inner.running.lock().as_ref() {
            Some(running) => running.command_tx.try_send(command).is_ok(),
            None => false,
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Queue a mutation. Persisted before returning, reflected in `read`
    /// immediately, never rejected for lack of network.
    pub fn mutate(&self, resource_key: &str, mutation: Mutation) -> Enqueued {
        self.enqueue(resource_key, mutation, false)
    }

    /// Like [`mutate`](Self::mutate), but the action is only dispatched once
    /// connectivity has been confirmed by a probe.
    pub fn mutate_strong(&self, resource_key: &str, mutation: Mutation) -> Enqueued {
        self.enqueue(resource_key, mutation, true)
    }

    fn enqueue(&self, resource_key: &str, mutation: Mutation, strong: bool) -> Enqueued {
        let receipt = self
            .inner
            .queue
            .enqueue(resource_key, mutation, strong, Utc::now());

        if let Some(warning) = &receipt.warning {
            self.inner.events.emit(SyncEvent::StorageDegraded {
                reason: warning.clone(),
            });
        }
        self.inner.events.emit(SyncEvent::Enqueued {
            resource_key: resource_key.to_string(),
            id: receipt.id.clone(),
        });
        self.inner.events.emit(SyncEvent::ViewChanged {
            resource_key: resource_key.to_string(),
        });

        if self.inner.connectivity.current().is_online {
            self.send(SyncCommand::SyncNow);
        }
        receipt
    }

    pub fn create(&self, resource_key: &str, doc: Document) -> Enqueued {
        self.mutate(resource_key, Mutation::Create { doc })
    }

    pub fn update(&self, resource_key: &str, target: impl Into<TargetId>, patch: Document) -> Enqueued {
        self.mutate(
            resource_key,
            Mutation::Update {
                target: target.into(),
                patch,
            },
        )
    }

    pub fn delete(&self, resource_key: &str, target: impl Into<TargetId>) -> Enqueued {
        self.mutate(
            resource_key,
            Mutation::Delete {
                target: target.into(),
            },
        )
    }

    /// Flip a boolean field. The new value is computed from the current
    /// effective view; a missing field counts as `false`.
    pub fn toggle(&self, resource_key: &str, target: impl Into<TargetId>, field: &str) -> Enqueued {
        let target = self.resolve_target(target.into());
        let current = self
            .view(resource_key)
            .get(target.as_str())
            .and_then(|item| item.get(field))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.mutate(
            resource_key,
            Mutation::ToggleFlag {
                target,
                field: field.to_string(),
                value: !current,
            },
        )
    }

    fn resolve_target(&self, target: TargetId) -> TargetId {
        match target.as_local().and_then(|l| self.inner.queue.server_id_for(l)) {
            Some(server) => TargetId::Server(server),
            None => target,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cached snapshot merged with pending actions.
    ///
    /// Served regardless of TTL. When online and the snapshot is missing or
    /// expired, one background refresh is requested per expiry.
    pub fn read(&self, resource_key: &str) -> EffectiveView {
        let now = Utc::now();
        let needs_refresh = self
            .inner
            .cache
            .get(resource_key)
            .map(|e| e.is_expired(now))
            .unwrap_or(true);

        if needs_refresh
            && self.inner.connectivity.current().is_online
            && self.inner.cache.claim_revalidation(resource_key)
        {
            debug!("Requesting revalidation of '{}'", resource_key);
            if !self.send(SyncCommand::Revalidate(resource_key.to_string())) {
                self.inner.cache.release_revalidation(resource_key);
            }
        }

        self.project(resource_key, now)
    }

    /// Effective view without triggering a refresh.
    pub fn view(&self, resource_key: &str) -> EffectiveView {
        self.project(resource_key, Utc::now())
    }

    fn project(&self, resource_key: &str, now: DateTime<Utc>) -> EffectiveView {
        let (entry, pending) = {
            let _view = self.inner.reconciler.view_guard();
            (
                self.inner.cache.get(resource_key),
                self.inner.queue.pending_for(resource_key),
            )
        };
        projector::project(
            resource_key,
            entry.as_deref(),
            &pending,
            &self.inner.config.id_field,
            now,
        )
    }

    /// Fetch a resource now and return its fresh effective view.
    pub async fn refresh(&self, resource_key: &str) -> SyncResult<EffectiveView> {
        self.inner.reconciler.refresh(resource_key).await?;
        Ok(self.view(resource_key))
    }

    pub fn collection<R: Resource>(&self, resource_key: &str) -> Collection<'_, R> {
        Collection {
            engine: self,
            resource_key: resource_key.to_string(),
            _marker: PhantomData,
        }
    }

    // ========================================================================
    // Events and connectivity
    // ========================================================================

    pub fn subscribe(&self, resource_key: &str) -> ResourceSubscription {
        ResourceSubscription::new(resource_key, self.inner.events.subscribe())
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.inner.connectivity.current()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.connectivity.subscribe()
    }

    pub fn report_platform_signal(&self, signal: PlatformSignal) {
        self.inner.connectivity.report(signal);
    }

    /// Probe once, if a probe is configured, and return the resulting state.
    pub async fn check_connectivity(&self) -> ConnectivityState {
        match &self.inner.probe {
            Some(probe) => self.inner.connectivity.check(probe.as_ref()).await,
            None => self.inner.connectivity.current(),
        }
    }

    // ========================================================================
    // Sync control
    // ========================================================================

    /// Ask the background worker to drain. Does not wait and never cancels
    /// an in-flight call.
    pub fn force_sync(&self) -> SyncResult<()> {
        let running = self.inner.running.lock();
        let running = running.as_ref().ok_or(SyncError::EngineStopped)?;
        match running.command_tx.try_send(SyncCommand::SyncNow) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::EngineStopped),
        }
    }

    /// Drain the queue and wait for the result.
    pub async fn sync_now(&self) -> DrainReport {
        self.inner.reconciler.drain().await
    }

    pub fn status(&self) -> SyncStatus {
        let stats = self.inner.cache.stats();
        SyncStatus {
            connectivity: self.inner.connectivity.current(),
            last_sync_at: self.inner.reconciler.last_sync(),
            queued_actions: self.inner.queue.len(),
            dead_letters: self.inner.queue.dead_letter_count(),
            cache_entries: stats.entries,
            cache_size_bytes: stats.size_bytes,
            cache_size: stats.formatted_size(),
            storage_degraded: self.inner.queue.is_degraded(),
        }
    }

    pub fn pending_actions(&self) -> Vec<QueuedAction> {
        self.inner.queue.all_pending()
    }

    // ========================================================================
    // Dead letters
    // ========================================================================

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.queue.dead_letters()
    }

    /// Re-queue a dead letter at the tail of its sub-queue.
    pub fn retry_dead_letter(&self, id: &LocalId) -> SyncResult<()> {
        let action = self.inner.queue.retry_dead_letter(id)?;
        self.inner.events.emit(SyncEvent::Enqueued {
            resource_key: action.resource_key.clone(),
            id: action.id.clone(),
        });
        self.inner.events.emit(SyncEvent::ViewChanged {
            resource_key: action.resource_key,
        });
        if self.inner.connectivity.current().is_online {
            self.send(SyncCommand::SyncNow);
        }
        Ok(())
    }

    pub fn discard_dead_letter(&self, id: &LocalId) -> SyncResult<()> {
        self.inner.queue.discard_dead_letter(id)?;
        Ok(())
    }

    /// Drop every pending action, dead letter, id alias, cached entry and
    /// the last sync time.
    pub fn clear_all(&self) {
        let mut keys = self.inner.queue.resource_keys();
        for key in self.inner.cache.keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        self.inner.queue.clear();
        self.inner.cache.clear();
        self.inner.reconciler.clear_last_sync();

        for resource_key in keys {
            self.inner
                .events
                .emit(SyncEvent::ViewChanged { resource_key });
        }
        info!("All offline data cleared");
    }
}

// ============================================================================
// Typed collections
// ============================================================================

/// A document type stored under one resource key.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Partial update payload
    type Patch: Serialize;
}

/// A decoded item of a typed view.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<R> {
    pub id: String,
    /// Touched by an action that has not been confirmed yet
    pub pending: bool,
    pub data: R,
}

/// Typed handle on one resource key.
pub struct Collection<'a, R: Resource> {
    engine: &'a SyncEngine,
    resource_key: String,
    _marker: PhantomData<R>,
}

impl<'a, R: Resource> Collection<'a, R> {
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Fails only if `value` does not serialize to a JSON object.
    pub fn create(&self, value: &R) -> SyncResult<Enqueued> {
        let doc = to_document(value)?;
        Ok(self.engine.create(&self.resource_key, doc))
    }

    pub fn update(&self, id: &str, patch: &R::Patch) -> SyncResult<Enqueued> {
        let patch = to_document(patch)?;
        Ok(self.engine.update(&self.resource_key, id, patch))
    }

    pub fn delete(&self, id: &str) -> Enqueued {
        self.engine.delete(&self.resource_key, id)
    }

    pub fn toggle(&self, id: &str, field: &str) -> Enqueued {
        self.engine.toggle(&self.resource_key, id, field)
    }

    /// Decoded effective view. Items that do not decode as `R` are skipped.
    pub fn read(&self) -> Vec<Record<R>> {
        let view = self.engine.read(&self.resource_key);
        let id_field = self.engine.config().id_field.as_str();

        view.items
            .iter()
            .filter_map(|item| {
                let id = item_id(item, id_field)?.to_string();
                let mut fields = item.clone();
                fields.remove(id_field);
                match serde_json::from_value::<R>(Value::Object(fields)) {
                    Ok(data) => Some(Record {
                        pending: view.is_pending(&id),
                        id,
                        data,
                    }),
                    Err(e) => {
                        warn!(
                            "Skipping undecodable item {} in '{}': {}",
                            id, self.resource_key, e
                        );
                        None
                    }
                }
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Record<R>> {
        self.read().into_iter().find(|record| record.id == id)
    }
}

fn to_document<T: Serialize>(value: &T) -> SyncResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Json(<serde_json::Error as serde::ser::Error>::custom(
            format!("expected a JSON object, got {}", other),
        ))),
    }
}
