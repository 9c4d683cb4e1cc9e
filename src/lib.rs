//! Offline-first sync engine.
//!
//! Mutations are accepted immediately, persisted to a durable queue and
//! replayed against a remote resource store once connectivity returns.
//! Reads are served from a TTL cache merged with the pending actions.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod ids;
pub mod projector;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;

pub use cache::{format_size, CacheEntry, CacheStats, CacheStore};
pub use config::{CacheConfig, ConnectivityConfig, ResourceConfig, RetryConfig, SyncConfig};
pub use connectivity::{ConnectivityState, HttpProbe, PlatformSignal, Reachability};
pub use engine::{Collection, Record, Resource, SyncEngine, SyncEngineBuilder, SyncStatus};
pub use error::{RemoteError, StorageError, SyncError, SyncResult};
pub use ids::{LocalId, ServerId, TargetId};
pub use projector::EffectiveView;
pub use queue::{DeadLetter, Enqueued, Mutation, MutationKind, QueuedAction};
pub use remote::{Document, HttpRemoteStore, ListFilter, RemoteStore};
pub use storage::{KvStorage, MemoryStorage, SqliteStorage};
pub use sync::{DrainReport, ResourceSubscription, SyncEvent};
