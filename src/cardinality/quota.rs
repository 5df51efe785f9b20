//! Quota Types
//!
//! Immutable value types describing a sliding-window cardinality limit, the
//! request that attaches limits to a set of candidate hashes, and the grant
//! returned for it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::error::{QuotaError, Result};

/// Stable identifier for a quota's bucket data
///
/// Quotas that differ only by `limit` share an id and therefore share usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaId {
    pub window_seconds: u64,
    pub granularity_seconds: u64,
}

impl fmt::Display for QuotaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s/{}s", self.window_seconds, self.granularity_seconds)
    }
}

/// A sliding-window limit on the number of distinct hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawQuota", into = "RawQuota")]
pub struct Quota {
    window_seconds: u64,
    granularity_seconds: u64,
    limit: u64,
}

/// Unvalidated wire form of [`Quota`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawQuota {
    window_seconds: i64,
    granularity_seconds: i64,
    limit: i64,
}

impl TryFrom<RawQuota> for Quota {
    type Error = QuotaError;

    fn try_from(raw: RawQuota) -> Result<Self> {
        if raw.window_seconds <= 0 {
            return Err(QuotaError::InvalidQuota(format!(
                "window_seconds must be positive, got {}",
                raw.window_seconds
            )));
        }
        if raw.granularity_seconds <= 0 {
            return Err(QuotaError::InvalidQuota(format!(
                "granularity_seconds must be positive, got {}",
                raw.granularity_seconds
            )));
        }
        if raw.limit < 0 {
            return Err(QuotaError::InvalidQuota(format!(
                "limit must not be negative, got {}",
                raw.limit
            )));
        }
        Quota::new(
            raw.window_seconds as u64,
            raw.granularity_seconds as u64,
            raw.limit as u64,
        )
    }
}

impl From<Quota> for RawQuota {
    fn from(quota: Quota) -> Self {
        Self {
            window_seconds: quota.window_seconds as i64,
            granularity_seconds: quota.granularity_seconds as i64,
            limit: quota.limit as i64,
        }
    }
}

impl Quota {
    /// Create a new quota
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuota` if either duration is zero or the window is not
    /// a whole number of granularity buckets.
    pub fn new(window_seconds: u64, granularity_seconds: u64, limit: u64) -> Result<Self> {
        if window_seconds == 0 {
            return Err(QuotaError::InvalidQuota(
                "window_seconds must be positive".to_string(),
            ));
        }
        if granularity_seconds == 0 {
            return Err(QuotaError::InvalidQuota(
                "granularity_seconds must be positive".to_string(),
            ));
        }
        if window_seconds % granularity_seconds != 0 {
            return Err(QuotaError::InvalidQuota(format!(
                "window_seconds ({}) must be a multiple of granularity_seconds ({})",
                window_seconds, granularity_seconds
            )));
        }

        Ok(Self {
            window_seconds,
            granularity_seconds,
            limit,
        })
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    pub fn granularity_seconds(&self) -> u64 {
        self.granularity_seconds
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Identifier of the bucket data this quota reads and writes
    pub fn id(&self) -> QuotaId {
        QuotaId {
            window_seconds: self.window_seconds,
            granularity_seconds: self.granularity_seconds,
        }
    }

    /// Time-to-live for buckets written under this quota
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Start of the granularity bucket containing `timestamp`
    pub fn bucket_start(&self, timestamp: u64) -> u64 {
        timestamp / self.granularity_seconds * self.granularity_seconds
    }

    /// Number of buckets making up one window
    pub fn buckets_per_window(&self) -> u64 {
        self.window_seconds / self.granularity_seconds
    }

    /// Bucket starts inside the window ending at `now`, newest first
    ///
    /// A bucket is inside the window when `bucket_start > now - window_seconds`.
    pub fn window_buckets(&self, now: u64) -> impl Iterator<Item = u64> {
        let granularity = self.granularity_seconds;
        let newest = self.bucket_start(now);
        // None when the window reaches back past the epoch
        let expired_at = now.checked_sub(self.window_seconds);

        (0..self.buckets_per_window())
            .map_while(move |i| newest.checked_sub(i * granularity))
            .take_while(move |&start| match expired_at {
                Some(expired_at) => start > expired_at,
                None => true,
            })
    }
}

/// A batch entry: candidate hashes for one prefix and the quotas they must satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedQuota {
    /// Logical key the quotas apply to
    pub prefix: String,

    /// Candidate hashes in request order
    pub unit_hashes: Vec<u64>,

    /// Quotas that must all be satisfied
    #[serde(default)]
    pub quotas: Vec<Quota>,
}

impl RequestedQuota {
    pub fn new(prefix: impl Into<String>, unit_hashes: Vec<u64>, quotas: Vec<Quota>) -> Self {
        Self {
            prefix: prefix.into(),
            unit_hashes,
            quotas,
        }
    }
}

/// Outcome of checking one [`RequestedQuota`]
///
/// Nothing in a grant counts against a quota until it is passed to
/// `use_quotas`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Prefix of the originating request
    pub prefix: String,

    /// Quotas of the originating request
    pub quotas: Vec<Quota>,

    /// Admitted hashes, an order-preserving subsequence of the request's hashes
    pub granted_unit_hashes: Vec<u64>,

    /// First quota that caused a candidate to be denied
    pub reached_quota: Option<Quota>,

    /// Whether the grant was produced without consulting the store
    #[serde(default)]
    pub fail_open: bool,
}

impl Grant {
    /// Grant every candidate of `request` because the store could not be read
    pub fn fail_open(request: &RequestedQuota) -> Self {
        Self {
            prefix: request.prefix.clone(),
            quotas: request.quotas.clone(),
            granted_unit_hashes: request.unit_hashes.clone(),
            reached_quota: None,
            fail_open: true,
        }
    }

    /// Grant every candidate of `request` without limiting it
    pub fn unlimited(request: &RequestedQuota) -> Self {
        Self {
            prefix: request.prefix.clone(),
            quotas: request.quotas.clone(),
            granted_unit_hashes: request.unit_hashes.clone(),
            reached_quota: None,
            fail_open: false,
        }
    }

    /// Number of hashes granted
    pub fn len(&self) -> usize {
        self.granted_unit_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granted_unit_hashes.is_empty()
    }
}

/// Current usage of a quota for one prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Prefix the usage belongs to
    pub prefix: String,

    /// Quota identifier
    pub quota_id: QuotaId,

    /// Configured limit
    pub limit: u64,

    /// Estimated distinct hashes in the window
    pub estimated_cardinality: u64,

    /// New distinct hashes that can still be admitted
    pub remaining: u64,

    /// Utilization percentage
    pub utilization_percent: f64,
}
