//! Synchronization
//!
//! - [`reconciler`]: drains queued actions against the remote store
//! - [`worker`]: background loop that decides when to drain
//! - [`events`]: broadcast channel consumed by subscribers

pub mod events;
pub mod reconciler;
pub mod worker;

pub use events::{EventBus, ResourceSubscription, SyncEvent};
pub use reconciler::{DrainReport, Reconciler};
pub use worker::{create_command_channel, SyncCommand, SyncWorker};
