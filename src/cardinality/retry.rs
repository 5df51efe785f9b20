//! Commit Retry
//!
//! Exponential backoff with jitter for `use_quotas` commits. Only transient
//! store errors are retried; once attempts run out the commit is dropped,
//! which can only under-count.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use super::error::{QuotaError, Result};

/// Retry configuration
///
/// # Fields
///
/// * `max_attempts` - Attempts including the first one (default: 3)
/// * `base_delay` - Delay before the first retry (default: 10ms)
/// * `max_delay` - Cap on any single delay (default: 200ms)
/// * `jitter` - Random delay variation factor (default: 0.1 = 10%)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including initial attempt)
    pub max_attempts: usize,

    /// Base delay before first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Never retry; a failed commit is dropped immediately
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay between retries
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay between retries
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (zero-based)
    ///
    /// `base_delay * 2^attempt`, plus up to `jitter` of itself, capped at
    /// `max_delay`.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponential_delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.min(31) as u32));

        let jitter_range = exponential_delay.mul_f64(self.jitter);
        let jitter_offset = rand::random::<f64>() * jitter_range.as_secs_f64();
        let jittered_delay =
            exponential_delay.saturating_add(Duration::from_secs_f64(jitter_offset));

        jittered_delay.min(self.max_delay)
    }
}

/// Serializable retry settings as they appear in config files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per commit, including the first
    pub max_attempts: usize,

    /// Base backoff in milliseconds
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,

    /// Jitter factor
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            jitter: config.jitter,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig::new()
            .max_attempts(settings.max_attempts)
            .base_delay(Duration::from_millis(settings.base_delay_ms))
            .max_delay(Duration::from_millis(settings.max_delay_ms))
            .jitter(settings.jitter)
    }
}

/// Retry an operation with exponential backoff
///
/// Non-transient errors are returned immediately.
pub async fn retry_with_backoff<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!("Commit succeeded on attempt {}", attempt + 1);
                }
                return Ok(result);
            }
            Err(e) if e.is_transient() && attempt + 1 < config.max_attempts => {
                let delay = config.calculate_delay(attempt);
                tracing::debug!(
                    "Attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| QuotaError::BackendUnavailable("no attempts made".to_string())))
}
