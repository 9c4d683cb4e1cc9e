//! Durable Action Queue
//!
//! Pending mutations are kept in one global enqueue order; the sub-queue
//! of a resource key is the subsequence of actions carrying that key, so
//! FIFO within a key falls out of the storage order. The whole queue is
//! written through to [`KvStorage`] before `enqueue` returns.
//!
//! Persisted layout, under the configured namespace:
//! - `{ns}:queue`: `{ "next_seq": u64, "actions": [...] }`
//! - `{ns}:dead_letters`: list of [`DeadLetter`]
//! - `{ns}:id_map`: resolved `LocalId -> ServerId` aliases

pub mod backoff;
pub mod types;

pub use backoff::RetryPolicy;
pub use types::{
    DeadLetter, Enqueued, FailOutcome, Mutation, MutationKind, QueuedAction, Resolution,
};

use crate::error::{StorageError, SyncError, SyncResult};
use crate::ids::{LocalId, ServerId, TargetId};
use crate::storage::{namespaced, KvStorage};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Serialize, Deserialize)]
struct PersistedQueue<A> {
    next_seq: u64,
    actions: Vec<A>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    actions: Vec<QueuedAction>,
    dead_letters: Vec<DeadLetter>,
    id_map: BTreeMap<LocalId, ServerId>,
    /// Persistence failed this session; the queue lives in memory only
    degraded: bool,
    degraded_warned: bool,
    corrupt_entries: usize,
}

pub struct ActionQueue {
    storage: Arc<dyn KvStorage>,
    namespace: String,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
}

impl ActionQueue {
    /// Load the queue from storage.
    ///
    /// Individual malformed entries are skipped and counted. A queue document
    /// that cannot be parsed at all is moved aside to `{ns}:queue.corrupt`.
    pub fn load(storage: Arc<dyn KvStorage>, namespace: &str, policy: RetryPolicy) -> Self {
        let queue = Self {
            storage,
            namespace: namespace.to_string(),
            policy,
            state: Mutex::new(QueueState::default()),
        };

        let mut state = QueueState {
            next_seq: 1,
            ..Default::default()
        };
        queue.load_actions(&mut state);
        state.dead_letters = queue.load_list("dead_letters", &mut state.corrupt_entries);
        state.id_map = queue.load_id_map();

        // Never hand out a local id that is still referenced anywhere
        let highest = state
            .actions
            .iter()
            .map(|a| &a.id)
            .chain(state.dead_letters.iter().map(|d| &d.action.id))
            .chain(state.id_map.keys())
            .filter_map(|id| id.seq())
            .max()
            .unwrap_or(0);
        state.next_seq = state.next_seq.max(highest + 1);

        if !state.actions.is_empty() || !state.dead_letters.is_empty() {
            info!(
                "Loaded action queue: {} pending, {} dead letters",
                state.actions.len(),
                state.dead_letters.len()
            );
        }
        if state.corrupt_entries > 0 {
            warn!(
                "Skipped {} corrupt queue entries while loading",
                state.corrupt_entries
            );
        }

        *queue.state.lock() = state;
        queue
    }

    fn key(&self, suffix: &str) -> String {
        namespaced(&self.namespace, suffix)
    }

    fn read(&self, suffix: &str) -> Option<String> {
        match self.storage.get(&self.key(suffix)) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to read {}: {}", self.key(suffix), e);
                None
            }
        }
    }

    fn load_actions(&self, state: &mut QueueState) {
        let Some(raw) = self.read("queue") else {
            return;
        };

        let doc: PersistedQueue<Value> = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                let err = SyncError::QueueCorruption(e.to_string());
                error!("Action queue unreadable, starting empty: {}", err);
                if let Err(e) = self.storage.put(&self.key("queue.corrupt"), &raw) {
                    warn!("Could not preserve corrupt queue document: {}", e);
                }
                state.corrupt_entries += 1;
                return;
            }
        };

        state.next_seq = doc.next_seq.max(1);
        for entry in doc.actions {
            match serde_json::from_value::<QueuedAction>(entry) {
                Ok(action) => state.actions.push(action),
                Err(e) => {
                    warn!("Skipping corrupt queued action: {}", e);
                    state.corrupt_entries += 1;
                }
            }
        }
    }

    fn load_list<T: serde::de::DeserializeOwned>(
        &self,
        suffix: &str,
        corrupt: &mut usize,
    ) -> Vec<T> {
        let Some(raw) = self.read(suffix) else {
            return vec![];
        };
        match serde_json::from_str::<Vec<Value>>(&raw) {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|entry| match serde_json::from_value(entry) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        warn!("Skipping corrupt entry in {}: {}", suffix, e);
                        *corrupt += 1;
                        None
                    }
                })
                .collect(),
            Err(e) => {
                error!("{} unreadable, starting empty: {}", suffix, e);
                *corrupt += 1;
                vec![]
            }
        }
    }

    fn load_id_map(&self) -> BTreeMap<LocalId, ServerId> {
        self.read("id_map")
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(map) => Some(map),
                Err(e) => {
                    warn!("Ignoring unreadable id map: {}", e);
                    None
                }
            })
            .unwrap_or_default()
    }

    fn write_all(&self, state: &QueueState) -> Result<(), StorageError> {
        let queue = PersistedQueue {
            next_seq: state.next_seq,
            actions: state.actions.clone(),
        };
        let encode = |e: serde_json::Error| StorageError::Unavailable(e.to_string());
        self.storage
            .put(&self.key("queue"), &serde_json::to_string(&queue).map_err(encode)?)?;
        self.storage.put(
            &self.key("dead_letters"),
            &serde_json::to_string(&state.dead_letters).map_err(encode)?,
        )?;
        self.storage.put(
            &self.key("id_map"),
            &serde_json::to_string(&state.id_map).map_err(encode)?,
        )?;
        Ok(())
    }

    /// Write through, switching to memory-only mode on the first failure.
    fn persist(&self, state: &mut QueueState) {
        if state.degraded {
            return;
        }
        if let Err(e) = self.write_all(state) {
            state.degraded = true;
            warn!(
                "Local storage unavailable ({}); pending actions are kept in memory for this session",
                e
            );
        }
    }

    fn resolve(id_map: &BTreeMap<LocalId, ServerId>, target: &mut TargetId) {
        if let TargetId::Local(local) = target {
            if let Some(server) = id_map.get(local) {
                *target = TargetId::Server(server.clone());
            }
        }
    }

    /// Append an action to its resource's sub-queue. Never fails: when
    /// storage is unavailable the action is still accepted in memory.
    pub fn enqueue(
        &self,
        resource_key: &str,
        mut mutation: Mutation,
        requires_strong_connectivity: bool,
        now: DateTime<Utc>,
    ) -> Enqueued {
        let mut state = self.state.lock();
        if let Some(target) = mutation.target_mut() {
            Self::resolve(&state.id_map, target);
        }

        let id = LocalId::from_seq(state.next_seq);
        state.next_seq += 1;

        debug!(
            "Enqueue {} {} on '{}'",
            mutation.kind(),
            id,
            resource_key
        );
        state.actions.push(QueuedAction {
            id: id.clone(),
            resource_key: resource_key.to_string(),
            mutation,
            enqueued_at: now,
            attempts: 0,
            last_error: None,
            requires_strong_connectivity,
            next_attempt_at: None,
        });

        self.persist(&mut state);
        let warning = if state.degraded && !state.degraded_warned {
            state.degraded_warned = true;
            Some(
                "Local storage unavailable; queued actions will not survive a restart".to_string(),
            )
        } else {
            None
        };

        Enqueued { id, warning }
    }

    /// Pending actions for one resource, in submission order.
    pub fn pending_for(&self, resource_key: &str) -> Vec<QueuedAction> {
        self.state
            .lock()
            .actions
            .iter()
            .filter(|a| a.resource_key == resource_key)
            .cloned()
            .collect()
    }

    pub fn all_pending(&self) -> Vec<QueuedAction> {
        self.state.lock().actions.clone()
    }

    pub fn get(&self, id: &LocalId) -> Option<QueuedAction> {
        self.state.lock().actions.iter().find(|a| &a.id == id).cloned()
    }

    pub fn head(&self, resource_key: &str) -> Option<QueuedAction> {
        self.state
            .lock()
            .actions
            .iter()
            .find(|a| a.resource_key == resource_key)
            .cloned()
    }

    /// Resource keys with pending actions, ordered by their oldest action.
    pub fn resource_keys(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = Vec::new();
        for action in &state.actions {
            if !keys.contains(&action.resource_key) {
                keys.push(action.resource_key.clone());
            }
        }
        keys
    }

    /// Earliest backoff deadline still ahead of `now`.
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .actions
            .iter()
            .filter_map(|a| a.next_attempt_at)
            .filter(|at| *at > now)
            .min()
    }

    pub fn len(&self) -> usize {
        self.state.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().actions.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    pub fn corrupt_entries(&self) -> usize {
        self.state.lock().corrupt_entries
    }

    pub fn server_id_for(&self, local: &LocalId) -> Option<ServerId> {
        self.state.lock().id_map.get(local).cloned()
    }

    /// Remove a confirmed action. Returns false if it was already gone.
    pub fn ack(&self, id: &LocalId) -> bool {
        let mut state = self.state.lock();
        let before = state.actions.len();
        state.actions.retain(|a| &a.id != id);
        if state.actions.len() == before {
            debug!("Ack for unknown action {} ignored", id);
            return false;
        }
        debug!("Acked {}", id);
        self.persist(&mut state);
        true
    }

    /// Confirm a `Create`: record the server id, rewrite every queued target
    /// that points at the local id, then remove the action. All of it happens
    /// under one lock, so no dispatch can observe the local id afterwards.
    pub fn resolve_create(&self, id: &LocalId, server_id: &ServerId) -> Option<Resolution> {
        let mut state = self.state.lock();
        let index = state.actions.iter().position(|a| &a.id == id)?;
        state.actions.remove(index);
        state.id_map.insert(id.clone(), server_id.clone());

        let mut rewritten = 0;
        let local_target = TargetId::Local(id.clone());
        for action in state.actions.iter_mut() {
            if let Some(target) = action.mutation.target_mut() {
                if *target == local_target {
                    *target = TargetId::Server(server_id.clone());
                    rewritten += 1;
                }
            }
        }
        for letter in state.dead_letters.iter_mut() {
            if let Some(target) = letter.action.mutation.target_mut() {
                if *target == local_target {
                    *target = TargetId::Server(server_id.clone());
                }
            }
        }

        debug!(
            "Resolved {} -> {} ({} queued actions rewritten)",
            id, server_id, rewritten
        );
        self.persist(&mut state);
        Some(Resolution {
            local: id.clone(),
            server: server_id.clone(),
            rewritten,
        })
    }

    /// Record a transient failure: back off, or dead-letter once the attempt
    /// budget is spent.
    pub fn fail(&self, id: &LocalId, error: &str, now: DateTime<Utc>) -> Option<FailOutcome> {
        let mut state = self.state.lock();
        let index = state.actions.iter().position(|a| &a.id == id)?;

        let attempts = {
            let action = &mut state.actions[index];
            action.attempts += 1;
            action.last_error = Some(error.to_string());
            action.attempts
        };

        if self.policy.is_exhausted(attempts) {
            let reason = format!("gave up after {} attempts: {}", attempts, error);
            let dependents = self.move_to_dead_letters(&mut state, index, reason, now);
            self.persist(&mut state);
            return Some(FailOutcome::DeadLettered { dependents });
        }

        let delay = self.policy.delay_for(attempts);
        let retry_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        state.actions[index].next_attempt_at = Some(retry_at);
        warn!(
            "Action {} failed (attempt {}/{}), retrying in {:?}: {}",
            id, attempts, self.policy.max_attempts, delay, error
        );
        self.persist(&mut state);
        Some(FailOutcome::Retry {
            attempt: attempts,
            retry_at,
        })
    }

    /// Move an action straight to the dead letter log (terminal failure).
    /// Returns the dependents dead-lettered with it.
    pub fn dead_letter(
        &self,
        id: &LocalId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<Vec<DeadLetter>> {
        let mut state = self.state.lock();
        let index = state.actions.iter().position(|a| &a.id == id)?;
        {
            let action = &mut state.actions[index];
            action.attempts += 1;
            action.last_error = Some(reason.to_string());
        }
        let dependents = self.move_to_dead_letters(&mut state, index, reason.to_string(), now);
        self.persist(&mut state);
        Some(dependents)
    }

    /// Drop an action that can no longer apply (remote conflict). Actions
    /// depending on a dropped `Create` are dead-lettered.
    pub fn drop_action(&self, id: &LocalId, now: DateTime<Utc>) -> Option<Vec<DeadLetter>> {
        let mut state = self.state.lock();
        let index = state.actions.iter().position(|a| &a.id == id)?;
        let action = state.actions.remove(index);
        let dependents = if action.kind() == MutationKind::Create {
            self.cascade(&mut state, &action.id, now)
        } else {
            vec![]
        };
        self.persist(&mut state);
        Some(dependents)
    }

    fn move_to_dead_letters(
        &self,
        state: &mut QueueState,
        index: usize,
        reason: String,
        now: DateTime<Utc>,
    ) -> Vec<DeadLetter> {
        let mut action = state.actions.remove(index);
        action.next_attempt_at = None;
        error!(
            "Action {} ({} on '{}') dead-lettered: {}",
            action.id,
            action.kind(),
            action.resource_key,
            reason
        );

        let cascades = action.kind() == MutationKind::Create;
        let id = action.id.clone();
        state.dead_letters.push(DeadLetter {
            action,
            reason,
            dead_lettered_at: now,
        });
        if cascades {
            self.cascade(state, &id, now)
        } else {
            vec![]
        }
    }

    /// Dead-letter every queued action that targets `local`.
    fn cascade(&self, state: &mut QueueState, local: &LocalId, now: DateTime<Utc>) -> Vec<DeadLetter> {
        let target = TargetId::Local(local.clone());
        let (dependents, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut state.actions)
            .into_iter()
            .partition(|a| a.target() == Some(&target));
        state.actions = remaining;

        let letters: Vec<DeadLetter> = dependents
            .into_iter()
            .map(|mut action| {
                action.next_attempt_at = None;
                DeadLetter {
                    action,
                    reason: format!("dependency {} failed", local),
                    dead_lettered_at: now,
                }
            })
            .collect();
        if !letters.is_empty() {
            warn!(
                "{} actions depending on {} dead-lettered",
                letters.len(),
                local
            );
        }
        state.dead_letters.extend(letters.iter().cloned());
        letters
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().dead_letters.len()
    }

    /// Put a dead letter back at the tail of its sub-queue with a fresh
    /// attempt budget. The action keeps its id.
    pub fn retry_dead_letter(&self, id: &LocalId) -> SyncResult<QueuedAction> {
        let mut state = self.state.lock();
        let index = state
            .dead_letters
            .iter()
            .position(|d| &d.action.id == id)
            .ok_or_else(|| SyncError::UnknownAction(id.to_string()))?;

        let mut action = state.dead_letters.remove(index).action;
        action.attempts = 0;
        action.last_error = None;
        action.next_attempt_at = None;
        if let Some(target) = action.mutation.target_mut() {
            Self::resolve(&state.id_map, target);
        }

        info!("Re-queued dead letter {} on '{}'", id, action.resource_key);
        state.actions.push(action.clone());
        self.persist(&mut state);
        Ok(action)
    }

    pub fn discard_dead_letter(&self, id: &LocalId) -> SyncResult<DeadLetter> {
        let mut state = self.state.lock();
        let index = state
            .dead_letters
            .iter()
            .position(|d| &d.action.id == id)
            .ok_or_else(|| SyncError::UnknownAction(id.to_string()))?;
        let letter = state.dead_letters.remove(index);
        info!("Discarded dead letter {}", id);
        self.persist(&mut state);
        Ok(letter)
    }

    /// Drop pending actions, dead letters and id aliases. The sequence keeps
    /// counting so old local ids are never reissued.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.actions.clear();
        state.dead_letters.clear();
        state.id_map.clear();
        self.persist(&mut state);
        info!("Action queue cleared");
    }

    /// Number of pending actions per resource key.
    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for action in &self.state.lock().actions {
            *counts.entry(action.resource_key.clone()).or_insert(0) += 1;
        }
        counts
    }
}
