//! Identifiers used by the sync engine.
//!
//! A [`LocalId`] is handed out at enqueue time and stays valid until the
//! remote store assigns the canonical [`ServerId`]. Local ids are always
//! rendered with the `temp_` prefix so the ids found in a projected view can
//! be told apart without a lookup.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix carried by every client-generated identifier.
pub const LOCAL_ID_PREFIX: &str = "temp_";

/// Temporary identifier generated on this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    /// Build the local id for a queue sequence number.
    pub fn from_seq(seq: u64) -> Self {
        Self(format!("{}{}", LOCAL_ID_PREFIX, seq))
    }

    /// Wrap an existing string. Returns `None` if it lacks the local prefix.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.starts_with(LOCAL_ID_PREFIX)
            .then(|| Self(raw.to_string()))
    }

    /// Sequence number encoded in the id, if well formed.
    pub fn seq(&self) -> Option<u64> {
        self.0.strip_prefix(LOCAL_ID_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authoritative identifier assigned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ServerId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Object a queued mutation applies to.
///
/// `Local` means the object is itself still waiting for its `Create` to be
/// confirmed, which is a causal dependency on an earlier queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum TargetId {
    Local(LocalId),
    Server(ServerId),
}

impl TargetId {
    /// Classify an id read back from a projected view.
    pub fn from_view_id(raw: &str) -> Self {
        match LocalId::parse(raw) {
            Some(local) => TargetId::Local(local),
            None => TargetId::Server(ServerId::from(raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetId::Local(id) => id.as_str(),
            TargetId::Server(id) => id.as_str(),
        }
    }

    pub fn as_local(&self) -> Option<&LocalId> {
        match self {
            TargetId::Local(id) => Some(id),
            TargetId::Server(_) => None,
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LocalId> for TargetId {
    fn from(id: LocalId) -> Self {
        TargetId::Local(id)
    }
}

impl From<ServerId> for TargetId {
    fn from(id: ServerId) -> Self {
        TargetId::Server(id)
    }
}

impl From<&str> for TargetId {
    fn from(raw: &str) -> Self {
        TargetId::from_view_id(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_roundtrip_seq() {
        let id = LocalId::from_seq(42);
        assert_eq!(id.as_str(), "temp_42");
        assert_eq!(id.seq(), Some(42));
        assert_eq!(LocalId::parse("temp_42"), Some(id));
        assert!(LocalId::parse("srv_42").is_none());
    }

    #[test]
    fn test_target_from_view_id() {
        assert_eq!(
            TargetId::from_view_id("temp_7"),
            TargetId::Local(LocalId::from_seq(7))
        );
        assert_eq!(
            TargetId::from_view_id("abc"),
            TargetId::Server(ServerId::new("abc"))
        );
    }

    #[test]
    fn test_target_serialization_is_tagged() {
        let target = TargetId::Local(LocalId::from_seq(3));
        let value = serde_json::to_value(&target).unwrap();
        assert_eq!(value, serde_json::json!({"type": "local", "id": "temp_3"}));
    }
}
