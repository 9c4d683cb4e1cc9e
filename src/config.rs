//! Engine configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config.
//! Values can be overlaid from `OFFLINE_SYNC_*` environment variables.

use crate::error::{SyncError, SyncResult};
use crate::remote::ListFilter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix for every key written to durable storage
    pub namespace: String,
    /// Field holding a document's identity in cached and projected items
    pub id_field: String,
    /// Periodic drain interval while online
    pub sync_interval_secs: u64,
    /// Minimum spacing between two post-settle refreshes of one resource
    pub refresh_min_interval_ms: u64,
    pub retry: RetryConfig,
    pub connectivity: ConnectivityConfig,
    pub cache: CacheConfig,
    /// Per-resource overrides
    pub resources: Vec<ResourceConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "offline_sync".to_string(),
            id_field: "id".to_string(),
            sync_interval_secs: 30,
            refresh_min_interval_ms: 2_000,
            retry: RetryConfig::default(),
            connectivity: ConnectivityConfig::default(),
            cache: CacheConfig::default(),
            resources: vec![],
        }
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay, 0.2 means +/-20%
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 5 * 60 * 1_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes needed to leave a verified online state
    pub offline_after_failures: u32,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_ms: 2_000,
            offline_after_failures: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub max_entries: usize,
    /// Entries persisted under another version are dropped at load
    pub version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 24 * 60 * 60,
            max_entries: 100,
            version: "1".to_string(),
        }
    }
}

/// Settings for one resource key (collection).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    pub key: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub filter: Option<ListFilter>,
    /// Refresh this resource after every reconnect
    #[serde(default)]
    pub prefetch: bool,
}

impl ResourceConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl_secs: None,
            filter: None,
            prefetch: false,
        }
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn with_filter(mut self, filter: ListFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn prefetch(mut self) -> Self {
        self.prefetch = true;
        self
    }
}

impl SyncConfig {
    /// Load a config from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> SyncResult<Self> {
        let config: SyncConfig =
            toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `OFFLINE_SYNC_*` environment variables.
    pub fn apply_env(mut self) -> SyncResult<Self> {
        if let Ok(ns) = std::env::var("OFFLINE_SYNC_NAMESPACE") {
            self.namespace = ns;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_INTERVAL_SECS")? {
            self.sync_interval_secs = v;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_PROBE_INTERVAL_SECS")? {
            self.connectivity.probe_interval_secs = v;
        }
        if let Some(v) = env_parse("OFFLINE_SYNC_CACHE_TTL_SECS")? {
            self.cache.default_ttl_secs = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.namespace.is_empty() {
            return Err(SyncError::Config("namespace must not be empty".into()));
        }
        if self.id_field.is_empty() {
            return Err(SyncError::Config("id_field must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(SyncError::Config("retry.jitter must be in [0, 1)".into()));
        }
        if self.connectivity.offline_after_failures == 0 {
            return Err(SyncError::Config(
                "connectivity.offline_after_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn resource(&self, key: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.key == key)
    }

    /// TTL for a resource, falling back to the cache default.
    pub fn ttl_for(&self, key: &str) -> Duration {
        let secs = self
            .resource(key)
            .and_then(|r| r.ttl_secs)
            .unwrap_or(self.cache.default_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn filter_for(&self, key: &str) -> Option<&ListFilter> {
        self.resource(key).and_then(|r| r.filter.as_ref())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn refresh_min_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_min_interval_ms)
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> SyncResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert_eq!(config.retry.max_delay_ms, 300_000);
        assert_eq!(config.connectivity.probe_interval_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_resource_overrides() {
        let config = SyncConfig::from_toml_str(
            r#"
            namespace = "pack"

            [retry]
            max_attempts = 3

            [[resources]]
            key = "announcements"
            ttl_secs = 7200
            prefetch = true

            [[resources]]
            key = "events"
            filter = { organizationId = "org-1" }
            "#,
        )
        .unwrap();

        assert_eq!(config.namespace, "pack");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert_eq!(config.ttl_for("announcements"), Duration::from_secs(7200));
        assert_eq!(config.ttl_for("events"), Duration::from_secs(86_400));
        assert!(config.resource("announcements").unwrap().prefetch);
        let filter = config.filter_for("events").unwrap();
        assert_eq!(filter.get("organizationId"), Some(&serde_json::json!("org-1")));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = SyncConfig::from_toml_str("[retry]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let err = SyncConfig::from_toml_str("[retry]\njitter = 1.5").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
