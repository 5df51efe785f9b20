// Configuration File Support
//
// TOML configuration for the cardquota binary and for services embedding the
// evaluator. Environment variables override file values.
// Default location: ~/.config/cardinality-quota/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cardinality::retry::RetrySettings;
use crate::cardinality::LimiterConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Limiter configuration
    pub limiter: LimiterConfig,

    /// Commit retry configuration
    pub retry: RetrySettings,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default config directory
    ///
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the resulting configuration is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cardinality-quota")
            .join("config.toml")
    }

    /// Apply environment variable overrides
    ///
    /// - CARDINALITY_QUOTA_LOG_LEVEL
    /// - CARDINALITY_QUOTA_LOG_FORMAT
    /// - CARDINALITY_QUOTA_ENABLED, _NUM_SHARDS, _NUM_PHYSICAL_SHARDS, _STORE_TIMEOUT_MS
    /// - CARDINALITY_QUOTA_COMMIT_ATTEMPTS
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("CARDINALITY_QUOTA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CARDINALITY_QUOTA_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(attempts) = lookup("CARDINALITY_QUOTA_COMMIT_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<usize>() {
                if attempts > 0 {
                    self.retry.max_attempts = attempts;
                }
            }
        }

        self.limiter = self.limiter.apply_overrides(&lookup);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.limiter.validate().context("Invalid limiter configuration")?;

        if self.retry.max_attempts == 0 {
            anyhow::bail!("Commit retry attempts must be > 0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            anyhow::bail!("Commit retry jitter must be between 0.0 and 1.0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
