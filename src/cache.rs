//! Cache Store
//!
//! Per-resource snapshots of the remote list, with a TTL. Entries are
//! immutable once built: every change swaps in a new `Arc<CacheEntry>`, so
//! a reader holding an entry never sees a partial write.
//!
//! Entries are written through to storage under `{ns}:cache:{key}` with an
//! index at `{ns}:cache_index`. Storage failures are logged and the cache
//! keeps working from memory.

use crate::config::CacheConfig;
use crate::ids::ServerId;
use crate::projector::{self, item_id};
use crate::queue::Mutation;
use crate::remote::Document;
use crate::storage::{namespaced, KvStorage};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub resource_key: String,
    /// Server order, unique ids
    pub items: Vec<Document>,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub version: String,
}

impl CacheEntry {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// `None` when the TTL reaches past the representable range.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl()).ok()?;
        self.fetched_at.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|at| now >= at).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
}

impl CacheStats {
    pub fn formatted_size(&self) -> String {
        format_size(self.size_bytes)
    }
}

/// Human readable size, `"12 KB"` below one megabyte, `"1.5 MB"` above.
pub fn format_size(bytes: usize) -> String {
    let kb = (bytes as f64 / 1024.0).round();
    if kb < 1024.0 {
        format!("{} KB", kb)
    } else {
        let mb = (kb / 1024.0 * 10.0).round() / 10.0;
        format!("{} MB", mb)
    }
}

pub struct CacheStore {
    storage: Arc<dyn KvStorage>,
    namespace: String,
    id_field: String,
    version: String,
    max_entries: usize,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    revalidating: Mutex<HashSet<String>>,
}

impl CacheStore {
    /// Load persisted entries. Unreadable entries and entries written by
    /// another cache version are dropped.
    pub fn load(
        storage: Arc<dyn KvStorage>,
        namespace: &str,
        id_field: &str,
        config: &CacheConfig,
    ) -> Self {
        let store = Self {
            storage,
            namespace: namespace.to_string(),
            id_field: id_field.to_string(),
            version: config.version.clone(),
            max_entries: config.max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
            revalidating: Mutex::new(HashSet::new()),
        };

        let mut loaded = HashMap::new();
        for key in store.read_index() {
            let raw = match store.storage.get(&store.entry_key(&key)) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read cache entry '{}': {}", key, e);
                    continue;
                }
            };
            match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) if entry.version == store.version => {
                    loaded.insert(key, Arc::new(entry));
                }
                Ok(entry) => {
                    info!(
                        "Dropping cache entry '{}' from version {} (current {})",
                        key, entry.version, store.version
                    );
                    store.remove_persisted(&key);
                }
                Err(e) => {
                    warn!("Dropping corrupt cache entry '{}': {}", key, e);
                    store.remove_persisted(&key);
                }
            }
        }

        if !loaded.is_empty() {
            debug!("Loaded {} cache entries", loaded.len());
        }
        *store.entries.write() = loaded;
        store.write_index();
        store
    }

    fn entry_key(&self, resource_key: &str) -> String {
        namespaced(&self.namespace, &format!("cache:{}", resource_key))
    }

    fn index_key(&self) -> String {
        namespaced(&self.namespace, "cache_index")
    }

    fn read_index(&self) -> Vec<String> {
        match self.storage.get(&self.index_key()) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Cache index unreadable, ignoring: {}", e);
                vec![]
            }),
            Ok(None) => vec![],
            Err(e) => {
                warn!("Failed to read cache index: {}", e);
                vec![]
            }
        }
    }

    fn write_index(&self) {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        let result = serde_json::to_string(&keys)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                self.storage
                    .put(&self.index_key(), &raw)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!("Failed to persist cache index: {}", e);
        }
    }

    fn persist_entry(&self, entry: &CacheEntry) {
        let result = serde_json::to_string(entry)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                self.storage
                    .put(&self.entry_key(&entry.resource_key), &raw)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!(
                "Failed to persist cache entry '{}': {}",
                entry.resource_key, e
            );
        }
    }

    fn remove_persisted(&self, resource_key: &str) {
        if let Err(e) = self.storage.delete(&self.entry_key(resource_key)) {
            warn!("Failed to delete cache entry '{}': {}", resource_key, e);
        }
    }

    pub fn get(&self, resource_key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(resource_key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Atomically replace the entry for a resource with a fresh snapshot.
    /// Duplicate ids keep their first position and last value.
    pub fn put(
        &self,
        resource_key: &str,
        items: Vec<Document>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            resource_key: resource_key.to_string(),
            items: self.dedupe(items),
            fetched_at: now,
            ttl_secs: ttl.as_secs(),
            version: self.version.clone(),
        });
        self.install(entry.clone());
        self.release_revalidation(resource_key);
        debug!(
            "Cached {} items for '{}'",
            entry.items.len(),
            resource_key
        );
        entry
    }

    fn dedupe(&self, items: Vec<Document>) -> Vec<Document> {
        let mut out: Vec<Document> = Vec::with_capacity(items.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for item in items {
            match item_id(&item, &self.id_field).map(str::to_string) {
                Some(id) => match positions.get(&id) {
                    Some(&index) => out[index] = item,
                    None => {
                        positions.insert(id, out.len());
                        out.push(item);
                    }
                },
                None => out.push(item),
            }
        }
        out
    }

    fn install(&self, entry: Arc<CacheEntry>) {
        self.persist_entry(&entry);
        let evicted = {
            let mut entries = self.entries.write();
            entries.insert(entry.resource_key.clone(), entry);
            let mut evicted = vec![];
            while entries.len() > self.max_entries {
                let oldest = entries
                    .values()
                    .min_by_key(|e| e.fetched_at)
                    .map(|e| e.resource_key.clone());
                match oldest {
                    Some(key) => {
                        entries.remove(&key);
                        evicted.push(key);
                    }
                    None => break,
                }
            }
            evicted
        };

        for key in &evicted {
            debug!("Evicted cache entry '{}'", key);
            self.remove_persisted(key);
        }
        self.write_index();
    }

    pub fn invalidate(&self, resource_key: &str) -> bool {
        let removed = self.entries.write().remove(resource_key).is_some();
        self.release_revalidation(resource_key);
        if removed {
            debug!("Invalidated cache entry '{}'", resource_key);
            self.remove_persisted(resource_key);
            self.write_index();
        }
        removed
    }

    /// Claim the single background refresh allowed per expiry.
    pub fn claim_revalidation(&self, resource_key: &str) -> bool {
        self.revalidating.lock().insert(resource_key.to_string())
    }

    pub fn release_revalidation(&self, resource_key: &str) {
        self.revalidating.lock().remove(resource_key);
    }

    pub fn is_revalidating(&self, resource_key: &str) -> bool {
        self.revalidating.lock().contains(resource_key)
    }

    /// Fold a confirmed write into the cached snapshot so the view does not
    /// flicker between the ack and the follow-up refresh. A confirmed create
    /// lands under `server_id`; without a snapshot it seeds an already
    /// expired one.
    pub fn apply_confirmed(
        &self,
        resource_key: &str,
        mutation: &Mutation,
        server_id: Option<&ServerId>,
        ttl: Duration,
    ) {
        let current = self.get(resource_key);
        let created_id = server_id.map(|s| s.as_str()).unwrap_or_default();

        let entry = match current {
            Some(entry) => {
                let mut items = entry.items.clone();
                projector::apply(&mut items, &self.id_field, created_id, mutation);
                CacheEntry {
                    items,
                    ..(*entry).clone()
                }
            }
            None => match mutation {
                Mutation::Create { .. } => {
                    let mut items = vec![];
                    projector::apply(&mut items, &self.id_field, created_id, mutation);
                    CacheEntry {
                        resource_key: resource_key.to_string(),
                        items,
                        fetched_at: DateTime::<Utc>::default(),
                        ttl_secs: ttl.as_secs(),
                        version: self.version.clone(),
                    }
                }
                _ => return,
            },
        };
        self.install(Arc::new(entry));
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        let size_bytes = entries
            .values()
            .map(|e| serde_json::to_string(e.as_ref()).map(|s| s.len()).unwrap_or(0))
            .sum();
        CacheStats {
            entries: entries.len(),
            size_bytes,
        }
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.write().drain().map(|(k, _)| k).collect();
        for key in &keys {
            self.remove_persisted(key);
        }
        self.revalidating.lock().clear();
        self.write_index();
        info!("Cache cleared ({} entries)", keys.len());
    }
}
