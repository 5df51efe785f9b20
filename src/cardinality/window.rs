//! Sliding Window Counter
//!
//! Decides, for one `(prefix, quota)`, which candidate hashes fit in the
//! trailing window. The window is the union of every granularity bucket whose
//! start lies in `(now - window_seconds, now]`, across all physical shards.
//! Hashes therefore expire a whole bucket at a time rather than at their
//! exact insertion instant.
//!
//! The counter never reads the clock; `now` always comes from the caller.

use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::error::Result;
use super::quota::{Quota, UsageStats};
use super::router::ShardRouter;
use super::store::{BucketKey, QuotaStore};

/// Bucketed distinct-value tracker on top of a [`QuotaStore`]
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter {
    store: Arc<dyn QuotaStore>,
    router: ShardRouter,
    store_timeout: Option<Duration>,
}

impl SlidingWindowCounter {
    /// Create a counter over `store`
    pub fn new(store: Arc<dyn QuotaStore>, router: ShardRouter) -> Self {
        Self {
            store,
            router,
            store_timeout: None,
        }
    }

    /// Bound every store call by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Decide which `candidates` can be admitted at `now`
    ///
    /// Hashes already in the window are always kept. New distinct hashes are
    /// kept in input order while the estimated cardinality stays below the
    /// limit. The result preserves input order, including duplicates.
    pub async fn evaluate(
        &self,
        prefix: &str,
        quota: &Quota,
        candidates: &[u64],
        now: u64,
    ) -> Result<Vec<u64>> {
        self.evaluate_with_pending(prefix, quota, candidates, &HashSet::new(), now)
            .await
    }

    /// Like [`SlidingWindowCounter::evaluate`], treating `pending` as already
    /// in the window
    ///
    /// `pending` holds hashes granted earlier in the same batch that are not
    /// committed yet.
    pub async fn evaluate_with_pending(
        &self,
        prefix: &str,
        quota: &Quota,
        candidates: &[u64],
        pending: &HashSet<u64>,
        now: u64,
    ) -> Result<Vec<u64>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut known = self.read_window(prefix, quota, now).await?;
        known.extend(pending.iter().copied());
        let stored = known.len() as u64;
        let mut fresh: HashSet<u64> = HashSet::new();
        let mut admitted = Vec::with_capacity(candidates.len());

        for &hash in candidates {
            if known.contains(&hash) || fresh.contains(&hash) {
                admitted.push(hash);
            } else if self
                .router
                .admits(stored + fresh.len() as u64, quota.limit())
            {
                fresh.insert(hash);
                admitted.push(hash);
            }
        }

        debug!(
            prefix,
            quota = %quota.id(),
            limit = quota.limit(),
            stored,
            new = fresh.len(),
            admitted = admitted.len(),
            denied = candidates.len() - admitted.len(),
            "Evaluated sliding window"
        );

        Ok(admitted)
    }

    /// Record `admitted` in the bucket containing `now`
    pub async fn commit(
        &self,
        prefix: &str,
        quota: &Quota,
        admitted: &[u64],
        now: u64,
    ) -> Result<()> {
        if admitted.is_empty() {
            return Ok(());
        }

        let bucket_start = quota.bucket_start(now);
        let mut by_shard: HashMap<u32, Vec<u64>> = HashMap::new();
        for &hash in admitted {
            let shard = self.router.route(prefix, hash).physical;
            by_shard.entry(shard).or_default().push(hash);
        }

        let ttl = quota.ttl();
        let writes = by_shard.into_iter().map(|(shard, hashes)| {
            let key = BucketKey::new(prefix, quota.id(), shard, bucket_start);
            async move {
                self.bounded(self.store.merge_bucket(&key, &hashes, ttl))
                    .await
            }
        });
        try_join_all(writes).await?;

        debug!(
            prefix,
            quota = %quota.id(),
            bucket_start,
            hashes = admitted.len(),
            "Committed hashes"
        );
        Ok(())
    }

    /// Current usage of `quota` for `prefix`
    pub async fn usage(&self, prefix: &str, quota: &Quota, now: u64) -> Result<UsageStats> {
        let stored = self.read_window(prefix, quota, now).await?.len() as u64;
        let estimated_cardinality = self.router.estimate(stored);
        let utilization_percent = if quota.limit() > 0 {
            (estimated_cardinality as f64 / quota.limit() as f64) * 100.0
        } else {
            0.0
        };

        Ok(UsageStats {
            prefix: prefix.to_string(),
            quota_id: quota.id(),
            limit: quota.limit(),
            estimated_cardinality,
            remaining: self.router.remaining(stored, quota.limit()),
            utilization_percent,
        })
    }

    /// Keys of every live bucket of `(prefix, quota)` across physical shards
    pub fn window_keys(&self, prefix: &str, quota: &Quota, now: u64) -> Vec<BucketKey> {
        let starts: Vec<u64> = quota.window_buckets(now).collect();
        (0..self.router.num_physical_shards())
            .flat_map(|shard| {
                starts
                    .iter()
                    .map(move |&start| BucketKey::new(prefix, quota.id(), shard, start))
            })
            .collect()
    }

    async fn read_window(&self, prefix: &str, quota: &Quota, now: u64) -> Result<HashSet<u64>> {
        let keys = self.window_keys(prefix, quota, now);
        self.bounded(self.store.union_buckets(&keys)).await
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match self.store_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call).await?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cardinality::store::MemoryStore;

    fn counter() -> SlidingWindowCounter {
        SlidingWindowCounter::new(Arc::new(MemoryStore::new()), ShardRouter::default())
    }

    async fn admit(
        counter: &SlidingWindowCounter,
        prefix: &str,
        quota: &Quota,
        candidates: &[u64],
        now: u64,
    ) -> Vec<u64> {
        let admitted = counter.evaluate(prefix, quota, candidates, now).await.unwrap();
        counter.commit(prefix, quota, &admitted, now).await.unwrap();
        admitted
    }

    #[tokio::test]
    async fn test_first_requested_first_served() {
        let counter = counter();
        let quota = Quota::new(3600, 60, 2).unwrap();

        let admitted = counter.evaluate("p", &quota, &[7, 8, 9], 3600).await.unwrap();
        assert_eq!(admitted, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_known_hashes_are_free() {
        let counter = counter();
        let quota = Quota::new(3600, 60, 2).unwrap();

        assert_eq!(admit(&counter, "p", &quota, &[1, 2], 3600).await, vec![1, 2]);
        // Budget exhausted, but 2 and 1 are already in the window
        let admitted = counter
            .evaluate("p", &quota, &[3, 2, 4, 1], 3660)
            .await
            .unwrap();
        assert_eq!(admitted, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_duplicates_cost_once() {
        let counter = counter();
        let quota = Quota::new(3600, 60, 2).unwrap();

        let admitted = counter
            .evaluate("p", &quota, &[5, 5, 6, 5, 7, 6], 3600)
            .await
            .unwrap();
        assert_eq!(admitted, vec![5, 5, 6, 5, 6]);
    }

    #[tokio::test]
    async fn test_evaluate_does_not_consume() {
        let counter = counter();
        let quota = Quota::new(3600, 60, 1).unwrap();

        for hash in 0..5 {
            let admitted = counter.evaluate("p", &quota, &[hash], 3600).await.unwrap();
            assert_eq!(admitted, vec![hash]);
        }
    }

    #[tokio::test]
    async fn test_pending_hashes_count_against_limit() {
        let counter = counter();
        let quota = Quota::new(3600, 60, 3).unwrap();
        admit(&counter, "p", &quota, &[1], 3600).await;

        let pending = HashSet::from([2, 3]);
        let admitted = counter
            .evaluate_with_pending("p", &quota, &[3, 4, 1], &pending, 3600)
            .await
            .unwrap();
        assert_eq!(admitted, vec![3, 1]);
    }

    #[tokio::test]
    async fn test_zero_limit_keeps_existing_admissions() {
        let counter = counter();
        let open = Quota::new(3600, 60, 5).unwrap();
        let closed = Quota::new(3600, 60, 0).unwrap();

        admit(&counter, "p", &open, &[1], 3600).await;

        // Same bucket data, limit lowered to zero
        let admitted = counter.evaluate("p", &closed, &[1, 2], 3700).await.unwrap();
        assert_eq!(admitted, vec![1]);

        let admitted = counter.evaluate("p", &closed, &[1, 2], 7200).await.unwrap();
        assert!(admitted.is_empty());
    }

    #[tokio::test]
    async fn test_bucket_expires_at_exact_window_age() {
        let counter = counter();
        let quota = Quota::new(600, 60, 1).unwrap();

        admit(&counter, "p", &quota, &[1], 1200).await;
        assert_eq!(
            counter.evaluate("p", &quota, &[2], 1799).await.unwrap(),
            Vec::<u64>::new()
        );
        assert_eq!(counter.evaluate("p", &quota, &[2], 1800).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_expiry_is_bucket_aligned() {
        let counter = counter();
        let quota = Quota::new(600, 60, 1).unwrap();

        // Written at 1259 into bucket 1200, which leaves the window at 1800
        admit(&counter, "p", &quota, &[1], 1259).await;
        assert_eq!(counter.evaluate("p", &quota, &[2], 1800).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_prefixes_are_independent() {
        let counter = counter();
        let quota = Quota::new(3600, 60, 1).unwrap();

        admit(&counter, "a", &quota, &[1], 3600).await;
        assert_eq!(admit(&counter, "b", &quota, &[2], 3600).await, vec![2]);
        assert!(admit(&counter, "a", &quota, &[2], 3600).await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_spreads_over_physical_shards() {
        let store = Arc::new(MemoryStore::new());
        let router = ShardRouter::new(4, 4).unwrap();
        let counter = SlidingWindowCounter::new(store.clone(), router);
        let quota = Quota::new(3600, 60, 1000).unwrap();

        let hashes: Vec<u64> = (0..200).collect();
        admit(&counter, "hot", &quota, &hashes, 3600).await;

        assert_eq!(store.bucket_count().await, 4);
        let usage = counter.usage("hot", &quota, 3600).await.unwrap();
        assert_eq!(usage.estimated_cardinality, 200);
        assert_eq!(usage.remaining, 800);
    }

    #[tokio::test]
    async fn test_sampling_saturates_early() {
        let store = Arc::new(MemoryStore::new());
        let router = ShardRouter::new(5, 1).unwrap();
        let counter = SlidingWindowCounter::new(store, router);
        let quota = Quota::new(3600, 60, 10).unwrap();

        let admitted = admit(&counter, "p", &quota, &[1, 2, 3, 4], 3600).await;
        assert_eq!(admitted, vec![1, 2]);

        let usage = counter.usage("p", &quota, 3600).await.unwrap();
        assert_eq!(usage.estimated_cardinality, 10);
        assert_eq!(usage.remaining, 0);
        assert_eq!(usage.utilization_percent, 100.0);
    }

    #[tokio::test]
    async fn test_window_keys() {
        let router = ShardRouter::new(2, 2).unwrap();
        let counter = SlidingWindowCounter::new(Arc::new(MemoryStore::new()), router);
        let quota = Quota::new(180, 60, 1).unwrap();

        let keys = counter.window_keys("p", &quota, 600);
        assert_eq!(keys.len(), 6);
        assert!(keys.iter().all(|k| k.bucket_start > 600 - 180));
    }
}
