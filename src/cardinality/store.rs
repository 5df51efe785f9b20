//! Quota Store
//!
//! The store adapter trait the counters are built on, plus an in-memory
//! implementation. All mutable quota state lives behind this trait; the
//! evaluator keeps nothing between calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::error::Result;
use super::quota::QuotaId;

/// Key for identifying one granularity bucket
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BucketKey {
    /// Logical key the quota applies to
    pub prefix: String,

    /// Quota the bucket belongs to
    pub quota_id: QuotaId,

    /// Physical shard of the prefix
    pub shard: u32,

    /// Start of the bucket's time slice (unix seconds)
    pub bucket_start: u64,
}

impl BucketKey {
    /// Create a new bucket key
    pub fn new(prefix: &str, quota_id: QuotaId, shard: u32, bucket_start: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            quota_id,
            shard,
            bucket_start,
        }
    }
}

impl fmt::Display for BucketKey {
    /// Redis-style key rendering, e.g. `cardinality:org-1:3600s/60s:0:7200`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cardinality:{}:{}:{}:{}",
            self.prefix, self.quota_id, self.shard, self.bucket_start
        )
    }
}

/// Abstract key-value backend holding bucket memberships
///
/// Implementations must be safe to share between tasks and processes: the
/// store is the single source of truth for admitted hashes.
#[async_trait]
pub trait QuotaStore: Send + Sync + fmt::Debug {
    /// Read the hashes held by one bucket; missing buckets are empty
    async fn get_bucket(&self, key: &BucketKey) -> Result<HashSet<u64>>;

    /// Add hashes to a bucket, creating it with the given TTL if absent
    async fn merge_bucket(&self, key: &BucketKey, hashes: &[u64], ttl: Duration) -> Result<()>;

    /// Union of several buckets' memberships
    ///
    /// Sits on the evaluation hot path; backends with a native multi-key
    /// union (e.g. `SUNION`) should override it.
    async fn union_buckets(&self, keys: &[BucketKey]) -> Result<HashSet<u64>> {
        let mut union = HashSet::new();
        for key in keys {
            union.extend(self.get_bucket(key).await?);
        }
        Ok(union)
    }
}

#[derive(Debug, Clone)]
struct StoredBucket {
    hashes: HashSet<u64>,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Buckets {
    entries: HashMap<BucketKey, StoredBucket>,

    /// Latest time seen, in the same logical clock buckets are keyed by
    clock: u64,
}

impl Buckets {
    fn live(&self, key: &BucketKey) -> Option<&StoredBucket> {
        self.entries
            .get(key)
            .filter(|bucket| bucket.expires_at > self.clock)
    }

    /// Advance the clock to `now` and drop every bucket expired by then
    fn advance(&mut self, now: u64) -> usize {
        if now <= self.clock {
            return 0;
        }
        self.clock = now;

        let before = self.entries.len();
        let clock = self.clock;
        self.entries.retain(|_, bucket| bucket.expires_at > clock);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, clock, "Swept expired buckets");
        }
        removed
    }
}

/// In-memory quota store
///
/// Expiry is tracked in the same logical clock the buckets are keyed by
/// (`bucket_start + ttl`). The clock advances with the newest bucket written,
/// and expired buckets are swept whenever it moves, so memory stays bounded
/// by the live windows.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    buckets: Arc<RwLock<Buckets>>,
}

impl MemoryStore {
    /// Create a new, empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove buckets whose TTL has passed at `now`
    ///
    /// Returns the number of buckets removed.
    pub async fn vacuum(&self, now: u64) -> usize {
        self.buckets.write().await.advance(now)
    }

    /// Get bucket count
    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.entries.len()
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_bucket(&self, key: &BucketKey) -> Result<HashSet<u64>> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .live(key)
            .map(|bucket| bucket.hashes.clone())
            .unwrap_or_default())
    }

    async fn merge_bucket(&self, key: &BucketKey, hashes: &[u64], ttl: Duration) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }

        let expires_at = key.bucket_start.saturating_add(ttl.as_secs());
        let mut buckets = self.buckets.write().await;
        buckets.advance(key.bucket_start);
        if expires_at <= buckets.clock {
            return Ok(());
        }

        let bucket = buckets
            .entries
            .entry(key.clone())
            .or_insert_with(|| StoredBucket {
                hashes: HashSet::new(),
                expires_at,
            });
        bucket.hashes.extend(hashes.iter().copied());
        Ok(())
    }

    async fn union_buckets(&self, keys: &[BucketKey]) -> Result<HashSet<u64>> {
        // Single read lock for the whole union
        let buckets = self.buckets.read().await;
        let mut union = HashSet::new();
        for key in keys {
            if let Some(bucket) = buckets.live(key) {
                union.extend(bucket.hashes.iter().copied());
            }
        }
        Ok(union)
    }
}
