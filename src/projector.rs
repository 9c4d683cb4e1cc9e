//! Optimistic Projector
//!
//! Overlays the pending queue of a resource onto its last cached snapshot,
//! replaying each action the way the remote store will apply it.

use crate::cache::CacheEntry;
use crate::queue::{Mutation, QueuedAction};
use crate::remote::Document;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// What a reader sees for one resource key. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveView {
    pub resource_key: String,
    pub items: Vec<Document>,
    /// Ids of items touched by at least one pending action
    pub pending_ids: BTreeSet<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    /// The underlying snapshot is past its TTL (or there is none)
    pub stale: bool,
    pub from_cache: bool,
    #[serde(skip)]
    id_field: String,
}

impl EffectiveView {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.items
            .iter()
            .find(|item| item_id(item, &self.id_field) == Some(id))
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending_ids.contains(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter_map(|item| item_id(item, &self.id_field))
            .collect()
    }
}

pub fn item_id<'a>(item: &'a Document, id_field: &str) -> Option<&'a str> {
    item.get(id_field).and_then(Value::as_str)
}

/// Apply one mutation to a working set. `created_id` is the identity given
/// to a created item. Mutations on a missing target are no-ops.
pub fn apply(items: &mut Vec<Document>, id_field: &str, created_id: &str, mutation: &Mutation) {
    match mutation {
        Mutation::Create { doc } => {
            let mut item = doc.clone();
            item.insert(id_field.to_string(), Value::String(created_id.to_string()));
            match position(items, id_field, created_id) {
                Some(index) => items[index] = item,
                None => items.push(item),
            }
        }
        Mutation::Update { target, patch } => {
            if let Some(index) = position(items, id_field, target.as_str()) {
                let item = &mut items[index];
                for (field, value) in patch {
                    if field != id_field {
                        item.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        Mutation::ToggleFlag {
            target,
            field,
            value,
        } => {
            if let Some(index) = position(items, id_field, target.as_str()) {
                items[index].insert(field.clone(), Value::Bool(*value));
            }
        }
        Mutation::Delete { target } => {
            items.retain(|item| item_id(item, id_field) != Some(target.as_str()));
        }
    }
}

fn position(items: &[Document], id_field: &str, id: &str) -> Option<usize> {
    items
        .iter()
        .position(|item| item_id(item, id_field) == Some(id))
}

/// Compute the effective view: cached items, then every pending action in
/// FIFO order.
pub fn project(
    resource_key: &str,
    entry: Option<&CacheEntry>,
    pending: &[QueuedAction],
    id_field: &str,
    now: DateTime<Utc>,
) -> EffectiveView {
    let mut items = entry.map(|e| e.items.clone()).unwrap_or_default();
    let mut pending_ids = BTreeSet::new();

    for action in pending.iter().filter(|a| a.resource_key == resource_key) {
        apply(&mut items, id_field, action.id.as_str(), &action.mutation);
        let touched = match action.target() {
            Some(target) => target.as_str().to_string(),
            None => action.id.to_string(),
        };
        pending_ids.insert(touched);
    }

    EffectiveView {
        resource_key: resource_key.to_string(),
        items,
        pending_ids,
        fetched_at: entry.map(|e| e.fetched_at),
        stale: entry.map(|e| e.is_expired(now)).unwrap_or(true),
        from_cache: entry.is_some(),
        id_field: id_field.to_string(),
    }
}
