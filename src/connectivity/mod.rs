//! Connectivity monitoring
//!
//! Combines platform online/offline signals with a periodic reachability
//! probe and publishes a de-duplicated [`ConnectivityState`].

pub mod monitor;
pub mod probe;

pub use monitor::ConnectivityMonitor;
pub use probe::{HttpProbe, Reachability};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide connectivity as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub is_online: bool,
    /// Online was confirmed by a successful probe. Always false when offline.
    pub verified: bool,
    pub since: DateTime<Utc>,
}

impl ConnectivityState {
    /// Startup assumption: online, not yet verified.
    pub fn assumed_online() -> Self {
        Self {
            is_online: true,
            verified: false,
            since: Utc::now(),
        }
    }

    pub fn is_verified_online(&self) -> bool {
        self.is_online && self.verified
    }

    /// Same observable state, ignoring the timestamp.
    pub fn same_as(&self, other: &ConnectivityState) -> bool {
        self.is_online == other.is_online && self.verified == other.verified
    }
}

/// Online/offline notification coming from the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformSignal {
    Online,
    Offline,
}
