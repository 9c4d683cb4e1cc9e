//! Remote resource store
//!
//! The engine talks to the authoritative store through four verbs. Anything
//! that can create, update, delete and list documents per resource key and
//! tell terminal failures from transient ones can sit behind this trait.

pub mod http;

pub use http::HttpRemoteStore;

use crate::error::RemoteError;
use crate::ids::ServerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A JSON object as stored by the remote store.
pub type Document = Map<String, Value>;

/// Field equality constraints applied to `list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListFilter(BTreeMap<String, Value>);

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Check a document against every constraint.
    pub fn matches(&self, doc: &Document) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a document and return its server-assigned id.
    async fn create(&self, resource_key: &str, doc: &Document) -> Result<ServerId, RemoteError>;

    /// Merge `patch` into an existing document.
    async fn update(
        &self,
        resource_key: &str,
        id: &ServerId,
        patch: &Document,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, resource_key: &str, id: &ServerId) -> Result<(), RemoteError>;

    /// List the collection in server order.
    async fn list(
        &self,
        resource_key: &str,
        filter: Option<&ListFilter>,
    ) -> Result<Vec<Document>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches() {
        let filter = ListFilter::new().field_eq("organizationId", "org-1");
        let hit = json!({"id": "1", "organizationId": "org-1"});
        let miss = json!({"id": "2", "organizationId": "org-2"});

        assert!(filter.matches(hit.as_object().unwrap()));
        assert!(!filter.matches(miss.as_object().unwrap()));
        assert!(ListFilter::new().matches(miss.as_object().unwrap()));
    }
}
