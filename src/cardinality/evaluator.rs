//! Quota Evaluator
//!
//! Public two-phase API. `check_within_quotas` reads the store and returns
//! grants without consuming anything; `use_quotas` commits what the caller
//! actually kept. Store failures during a check grant the affected request in
//! full, and failed commits are retried and then dropped, so a store outage
//! never blocks the caller.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::LimiterConfig;
use super::error::{QuotaError, Result};
use super::quota::{Grant, Quota, QuotaId, RequestedQuota, UsageStats};
use super::retry::{retry_with_backoff, RetryConfig};
use super::router::ShardRouter;
use super::store::QuotaStore;
use super::window::SlidingWindowCounter;
use crate::metrics;

/// Stateless quota evaluator
///
/// Cheap to clone and safe to share; all state lives in the store.
#[derive(Debug, Clone)]
pub struct QuotaEvaluator {
    /// `None` in noop mode
    counter: Option<SlidingWindowCounter>,

    /// Commit retry policy
    retry: RetryConfig,
}

impl QuotaEvaluator {
    /// Create an evaluator over `store`
    pub fn new(store: Arc<dyn QuotaStore>, router: ShardRouter) -> Self {
        Self {
            counter: Some(SlidingWindowCounter::new(store, router)),
            retry: RetryConfig::default(),
        }
    }

    /// Create an evaluator that grants everything and stores nothing
    pub fn noop() -> Self {
        Self {
            counter: None,
            retry: RetryConfig::default(),
        }
    }

    /// Create an evaluator from configuration
    ///
    /// A disabled configuration or a missing store yields the noop evaluator.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the shard configuration is invalid.
    pub fn from_config(
        config: &LimiterConfig,
        store: Option<Arc<dyn QuotaStore>>,
    ) -> Result<Self> {
        let router = config.router()?;

        let store = match store {
            Some(store) if config.enabled => store,
            _ => {
                debug!("Cardinality limiting disabled, using noop evaluator");
                return Ok(Self::noop());
            }
        };

        let mut counter = SlidingWindowCounter::new(store, router);
        if let Some(timeout) = config.store_timeout() {
            counter = counter.with_timeout(timeout);
        }

        Ok(Self {
            counter: Some(counter),
            retry: RetryConfig::default(),
        })
    }

    /// Set the commit retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether quotas are actually enforced
    pub fn is_enabled(&self) -> bool {
        self.counter.is_some()
    }

    /// Check a batch of requests against their quotas
    ///
    /// Returns the timestamp the check was made at (the given one, or the
    /// current unix time) and one grant per request, in request order. Pass
    /// the same timestamp to [`QuotaEvaluator::use_quotas`].
    pub async fn check_within_quotas(
        &self,
        requests: &[RequestedQuota],
        timestamp: Option<u64>,
    ) -> (u64, Vec<Grant>) {
        let timestamp = timestamp.unwrap_or_else(current_timestamp);
        let _timer = metrics::QUOTA_CHECK_DURATION_SECONDS.start_timer();
        metrics::QUOTA_CHECKS_TOTAL.inc_by(requests.len() as u64);

        // Requests sharing a prefix run in order so each one sees what the
        // earlier ones were granted; distinct prefixes run concurrently
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, request) in requests.iter().enumerate() {
            groups.entry(request.prefix.as_str()).or_default().push(index);
        }

        let checked = join_all(groups.into_values().map(|indices| async move {
            let mut pending = PendingHashes::new();
            let mut grants = Vec::with_capacity(indices.len());
            for index in indices {
                let grant = self
                    .check_request(&requests[index], &pending, timestamp)
                    .await;
                record_pending(&mut pending, &grant);
                grants.push((index, grant));
            }
            grants
        }))
        .await;

        let mut indexed: Vec<(usize, Grant)> = checked.into_iter().flatten().collect();
        indexed.sort_unstable_by_key(|(index, _)| *index);
        let grants: Vec<Grant> = indexed.into_iter().map(|(_, grant)| grant).collect();

        let failed = grants.iter().filter(|grant| grant.fail_open).count();
        match partial_failure(failed, grants.len()) {
            Some(err) => warn!(timestamp, "{}", err),
            None if failed > 0 => {
                warn!(timestamp, failed, "Every request in the batch failed open")
            }
            None => {}
        }

        let requested: usize = requests.iter().map(|r| r.unit_hashes.len()).sum();
        let granted: usize = grants.iter().map(Grant::len).sum();
        metrics::HASHES_GRANTED_TOTAL.inc_by(granted as u64);
        metrics::HASHES_DENIED_TOTAL.inc_by((requested - granted) as u64);

        (timestamp, grants)
    }

    /// Commit granted hashes into their quotas' buckets
    ///
    /// Grants sharing a prefix and quota are merged into a single write.
    /// Failed writes are retried and then dropped; the number of dropped
    /// writes is returned.
    pub async fn use_quotas(&self, grants: &[Grant], timestamp: u64) -> usize {
        let Some(counter) = &self.counter else {
            return 0;
        };

        let mut writes: HashMap<(&str, QuotaId), (Quota, Vec<u64>)> = HashMap::new();
        for grant in grants {
            if grant.granted_unit_hashes.is_empty() {
                continue;
            }
            for quota in &grant.quotas {
                let (_, hashes) = writes
                    .entry((grant.prefix.as_str(), quota.id()))
                    .or_insert_with(|| (*quota, Vec::new()));
                hashes.extend(grant.granted_unit_hashes.iter().copied());
            }
        }

        let results = join_all(writes.into_iter().map(|((prefix, _), (quota, hashes))| {
            let retry = &self.retry;
            async move {
                let result = retry_with_backoff(retry, || {
                    counter.commit(prefix, &quota, &hashes, timestamp)
                })
                .await;
                if let Err(e) = &result {
                    warn!(
                        prefix,
                        quota = %quota.id(),
                        hashes = hashes.len(),
                        "Dropping quota commit: {}",
                        e
                    );
                    metrics::COMMIT_FAILURES_TOTAL.inc();
                }
                result
            }
        }))
        .await;

        results.iter().filter(|result| result.is_err()).count()
    }

    /// Current usage of `quota` for `prefix`
    ///
    /// Returns `None` in noop mode. Unlike checks, inspection does not fail
    /// open: store errors are returned.
    pub async fn usage(
        &self,
        prefix: &str,
        quota: &Quota,
        timestamp: Option<u64>,
    ) -> Result<Option<UsageStats>> {
        let Some(counter) = &self.counter else {
            return Ok(None);
        };
        let timestamp = timestamp.unwrap_or_else(current_timestamp);
        counter.usage(prefix, quota, timestamp).await.map(Some)
    }

    async fn check_request(
        &self,
        request: &RequestedQuota,
        pending: &PendingHashes,
        timestamp: u64,
    ) -> Grant {
        let counter = match &self.counter {
            Some(counter) if !request.quotas.is_empty() && !request.unit_hashes.is_empty() => {
                counter
            }
            _ => return Grant::unlimited(request),
        };

        let none_pending = HashSet::new();
        let mut admitted_by_quota = Vec::with_capacity(request.quotas.len());
        for quota in &request.quotas {
            let pending = pending.get(&quota.id()).unwrap_or(&none_pending);
            match counter
                .evaluate_with_pending(
                    &request.prefix,
                    quota,
                    &request.unit_hashes,
                    pending,
                    timestamp,
                )
                .await
            {
                Ok(admitted) => {
                    admitted_by_quota.push(admitted.into_iter().collect::<HashSet<u64>>())
                }
                Err(e) => {
                    warn!(
                        prefix = %request.prefix,
                        quota = %quota.id(),
                        "Failing open: {}",
                        e
                    );
                    metrics::FAIL_OPEN_TOTAL.with_label_values(&["backend"]).inc();
                    return Grant::fail_open(request);
                }
            }
        }

        let reached_quota = request
            .quotas
            .iter()
            .zip(&admitted_by_quota)
            .find(|(_, admitted)| {
                request
                    .unit_hashes
                    .iter()
                    .any(|hash| !admitted.contains(hash))
            })
            .map(|(quota, _)| *quota);

        let granted_unit_hashes = request
            .unit_hashes
            .iter()
            .copied()
            .filter(|hash| admitted_by_quota.iter().all(|admitted| admitted.contains(hash)))
            .collect();

        Grant {
            prefix: request.prefix.clone(),
            quotas: request.quotas.clone(),
            granted_unit_hashes,
            reached_quota,
            fail_open: false,
        }
    }
}

/// Hashes granted earlier in a batch, per quota id, not yet committed
type PendingHashes = HashMap<QuotaId, HashSet<u64>>;

fn record_pending(pending: &mut PendingHashes, grant: &Grant) {
    for quota in &grant.quotas {
        pending
            .entry(quota.id())
            .or_default()
            .extend(grant.granted_unit_hashes.iter().copied());
    }
}

/// Error for a batch in which some, but not all, requests failed open
fn partial_failure(failed: usize, total: usize) -> Option<QuotaError> {
    (failed > 0 && failed < total).then_some(QuotaError::PartialBatchFailure { failed, total })
}

fn current_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
