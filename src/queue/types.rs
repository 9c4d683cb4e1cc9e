use crate::ids::{LocalId, ServerId, TargetId};
use crate::remote::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A mutation issued against one resource.
///
/// A `Create` carries a full document and has no target; every other kind
/// names the object it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Create {
        doc: Document,
    },
    Update {
        target: TargetId,
        patch: Document,
    },
    Delete {
        target: TargetId,
    },
    /// The new value is fixed when the action is enqueued, so replaying the
    /// action twice lands on the same state.
    ToggleFlag {
        target: TargetId,
        field: String,
        value: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    ToggleFlag,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
            MutationKind::ToggleFlag => write!(f, "toggle_flag"),
        }
    }
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create { .. } => MutationKind::Create,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
            Mutation::ToggleFlag { .. } => MutationKind::ToggleFlag,
        }
    }

    pub fn target(&self) -> Option<&TargetId> {
        match self {
            Mutation::Create { .. } => None,
            Mutation::Update { target, .. }
            | Mutation::Delete { target }
            | Mutation::ToggleFlag { target, .. } => Some(target),
        }
    }

    pub(crate) fn target_mut(&mut self) -> Option<&mut TargetId> {
        match self {
            Mutation::Create { .. } => None,
            Mutation::Update { target, .. }
            | Mutation::Delete { target }
            | Mutation::ToggleFlag { target, .. } => Some(target),
        }
    }

    /// Patch sent to the remote `update` verb.
    pub fn remote_patch(&self) -> Option<Document> {
        match self {
            Mutation::Update { patch, .. } => Some(patch.clone()),
            Mutation::ToggleFlag { field, value, .. } => {
                let mut patch = Document::new();
                patch.insert(field.clone(), Value::Bool(*value));
                Some(patch)
            }
            Mutation::Create { .. } | Mutation::Delete { .. } => None,
        }
    }
}

/// A mutation waiting in its resource's FIFO sub-queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: LocalId,
    pub resource_key: String,
    #[serde(flatten)]
    pub mutation: Mutation,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub requires_strong_connectivity: bool,
    /// Set while the action is backing off after a transient failure
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedAction {
    pub fn kind(&self) -> MutationKind {
        self.mutation.kind()
    }

    pub fn target(&self) -> Option<&TargetId> {
        self.mutation.target()
    }

    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map(|at| at > now).unwrap_or(false)
    }

    /// Local id this action waits on, if its target is still unresolved.
    pub fn pending_dependency(&self) -> Option<&LocalId> {
        self.target().and_then(|t| t.as_local())
    }
}

/// A terminally failed action, kept until the user retries or discards it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub action: QueuedAction,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Receipt returned by `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub id: LocalId,
    /// Set once, on the first enqueue after persistence failed
    pub warning: Option<String>,
}

/// What `fail` did with an action.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retry {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        /// Queued actions that depended on this one and were dead-lettered with it
        dependents: Vec<DeadLetter>,
    },
}

/// Rewrite applied when a create is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub local: LocalId,
    pub server: ServerId,
    /// Number of queued actions whose target was rewritten
    pub rewritten: usize,
}
