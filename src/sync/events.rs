//! Engine event channel.
//!
//! Failures never surface from `mutate`; they arrive here and in the dead
//! letter list instead.

use super::reconciler::DrainReport;
use crate::connectivity::ConnectivityState;
use crate::ids::{LocalId, ServerId};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connectivity(ConnectivityState),
    Enqueued {
        resource_key: String,
        id: LocalId,
    },
    /// The effective view of a resource may have changed
    ViewChanged {
        resource_key: String,
    },
    ActionSynced {
        resource_key: String,
        id: LocalId,
        server_id: Option<ServerId>,
    },
    RetryScheduled {
        resource_key: String,
        id: LocalId,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        resource_key: String,
        id: LocalId,
        reason: String,
    },
    /// The target no longer exists remotely; the action was dropped
    Conflict {
        resource_key: String,
        id: LocalId,
        reason: String,
    },
    StorageDegraded {
        reason: String,
    },
    DrainFinished(DrainReport),
}

impl SyncEvent {
    pub fn resource_key(&self) -> Option<&str> {
        match self {
            SyncEvent::Enqueued { resource_key, .. }
            | SyncEvent::ViewChanged { resource_key }
            | SyncEvent::ActionSynced { resource_key, .. }
            | SyncEvent::RetryScheduled { resource_key, .. }
            | SyncEvent::DeadLettered { resource_key, .. }
            | SyncEvent::Conflict { resource_key, .. } => Some(resource_key),
            SyncEvent::Connectivity(_)
            | SyncEvent::StorageDegraded { .. }
            | SyncEvent::DrainFinished(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Having no subscriber is fine.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Events for one resource key.
pub struct ResourceSubscription {
    resource_key: String,
    rx: broadcast::Receiver<SyncEvent>,
}

impl ResourceSubscription {
    pub(crate) fn new(resource_key: &str, rx: broadcast::Receiver<SyncEvent>) -> Self {
        Self {
            resource_key: resource_key.to_string(),
            rx,
        }
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Next event for this resource. `None` once the engine is dropped.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscription for '{}' lagged, {} events skipped",
                        self.resource_key, skipped
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &SyncEvent) -> bool {
        event.resource_key() == Some(self.resource_key.as_str())
    }
}
