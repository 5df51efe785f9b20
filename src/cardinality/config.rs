//! Limiter Configuration
//!
//! Per-instance settings for the quota evaluator. Quotas themselves are
//! supplied per call and are not part of this configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::Result;
use super::router::ShardRouter;

/// Default limiter settings
pub const DEFAULT_NUM_SHARDS: u32 = 1;
pub const DEFAULT_NUM_PHYSICAL_SHARDS: u32 = 1;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;

/// Limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Enable cardinality limiting; disabled grants everything
    pub enabled: bool,

    /// Logical shards per prefix
    pub cluster_num_shards: u32,

    /// Physical store partitions per prefix (at most `cluster_num_shards`)
    pub cluster_num_physical_shards: u32,

    /// Timeout for each store call in milliseconds (0 disables the timeout)
    pub store_timeout_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cluster_num_shards: DEFAULT_NUM_SHARDS,
            cluster_num_physical_shards: DEFAULT_NUM_PHYSICAL_SHARDS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

impl LimiterConfig {
    /// Create a new limiter configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `CARDINALITY_QUOTA_*` overrides read through `lookup`
    ///
    /// Unparseable values are ignored.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("CARDINALITY_QUOTA_ENABLED") {
            self.enabled = val.parse().unwrap_or(self.enabled);
        }

        if let Some(val) = lookup("CARDINALITY_QUOTA_NUM_SHARDS") {
            if let Ok(shards) = val.parse() {
                self.cluster_num_shards = shards;
            }
        }

        if let Some(val) = lookup("CARDINALITY_QUOTA_NUM_PHYSICAL_SHARDS") {
            if let Ok(shards) = val.parse() {
                self.cluster_num_physical_shards = shards;
            }
        }

        if let Some(val) = lookup("CARDINALITY_QUOTA_STORE_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                self.store_timeout_ms = timeout;
            }
        }

        self
    }

    /// Disable limiting (noop mode)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set shard counts
    pub fn with_shards(mut self, num_shards: u32, num_physical_shards: u32) -> Self {
        self.cluster_num_shards = num_shards;
        self.cluster_num_physical_shards = num_physical_shards;
        self
    }

    /// Get the per-call store timeout
    pub fn store_timeout(&self) -> Option<Duration> {
        (self.store_timeout_ms > 0).then(|| Duration::from_millis(self.store_timeout_ms))
    }

    /// Build the shard router described by this configuration
    pub fn router(&self) -> Result<ShardRouter> {
        ShardRouter::new(self.cluster_num_shards, self.cluster_num_physical_shards)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.router().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cardinality::error::QuotaError;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = LimiterConfig::default();
        assert!(config.enabled);
        assert_eq!(config.cluster_num_shards, DEFAULT_NUM_SHARDS);
        assert_eq!(config.cluster_num_physical_shards, DEFAULT_NUM_PHYSICAL_SHARDS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disabled_config() {
        let config = LimiterConfig::disabled();
        assert!(!config.enabled);
    }

    #[test]
    fn test_store_timeout() {
        let config = LimiterConfig::default();
        assert_eq!(config.store_timeout(), Some(Duration::from_millis(250)));

        let config = LimiterConfig {
            store_timeout_ms: 0,
            ..LimiterConfig::default()
        };
        assert_eq!(config.store_timeout(), None);
    }

    #[test]
    fn test_invalid_shards() {
        let config = LimiterConfig::default().with_shards(2, 4);
        assert!(matches!(config.validate(), Err(QuotaError::InvalidConfig(_))));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CARDINALITY_QUOTA_ENABLED", "false"),
            ("CARDINALITY_QUOTA_NUM_SHARDS", "8"),
            ("CARDINALITY_QUOTA_NUM_PHYSICAL_SHARDS", "2"),
            ("CARDINALITY_QUOTA_STORE_TIMEOUT_MS", "not-a-number"),
        ]);

        let config = LimiterConfig::default()
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert!(!config.enabled);
        assert_eq!(config.cluster_num_shards, 8);
        assert_eq!(config.cluster_num_physical_shards, 2);
        assert_eq!(config.store_timeout_ms, DEFAULT_STORE_TIMEOUT_MS);
    }

    #[test]
    fn test_config_serialization() {
        let config = LimiterConfig::default().with_shards(4, 2);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LimiterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
