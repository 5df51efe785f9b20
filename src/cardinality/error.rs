//! Cardinality Quota Error Types
//!
//! Errors surfaced by quota construction, configuration and the store adapter.
//! Backend errors never reach callers of `check_within_quotas`; they are
//! absorbed into fail-open grants.

/// Error types for cardinality quota operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    /// Store call failed or timed out
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Quota definition rejected at construction
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),

    /// Shard or limiter configuration rejected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Some requests of a batch failed open
    #[error("{failed} of {total} requests failed open")]
    PartialBatchFailure { failed: usize, total: usize },
}

impl QuotaError {
    /// Whether the error came from the store and may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, QuotaError::BackendUnavailable(_))
    }
}

impl From<tokio::time::error::Elapsed> for QuotaError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        QuotaError::BackendUnavailable(format!("store call timed out: {}", err))
    }
}

/// Result alias for quota operations
pub type Result<T> = std::result::Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(QuotaError::BackendUnavailable("down".to_string()).is_transient());
        assert!(!QuotaError::InvalidQuota("limit".to_string()).is_transient());
        assert!(!QuotaError::InvalidConfig("shards".to_string()).is_transient());
    }

    #[test]
    fn test_partial_batch_message() {
        let err = QuotaError::PartialBatchFailure {
            failed: 2,
            total: 5,
        };
        assert_eq!(err.to_string(), "2 of 5 requests failed open");
    }
}
