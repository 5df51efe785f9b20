// End-to-end admission scenarios against the in-memory store
//
// Every test drives the public check/commit API the way a caller would:
// check a batch, then commit the grants at the returned timestamp.

use cardinality_quota::cardinality::{ShardRouter, SlidingWindowCounter};
use cardinality_quota::{Grant, MemoryStore, Quota, QuotaEvaluator, QuotaStore, RequestedQuota};
use std::sync::Arc;

fn hourly(limit: u64) -> Quota {
    Quota::new(3600, 60, limit).unwrap()
}

fn evaluator() -> QuotaEvaluator {
    QuotaEvaluator::new(Arc::new(MemoryStore::new()), ShardRouter::default())
}

/// Check a single-request batch and commit whatever was granted
async fn admit(
    evaluator: &QuotaEvaluator,
    prefix: &str,
    hashes: Vec<u64>,
    quota: Quota,
    now: u64,
) -> Grant {
    let request = RequestedQuota::new(prefix, hashes, vec![quota]);
    let (timestamp, grants) = evaluator.check_within_quotas(&[request], Some(now)).await;
    assert_eq!(timestamp, now);
    assert_eq!(evaluator.use_quotas(&grants, timestamp).await, 0);
    grants.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_limit_of_ten_per_hour() {
    let evaluator = evaluator();
    let quota = hourly(10);

    // Repeating a known hash never consumes more than one slot
    for _ in 0..20 {
        let grant = admit(&evaluator, "org", vec![1], quota, 3600).await;
        assert_eq!(grant.granted_unit_hashes, vec![1]);
    }
    for _ in 0..20 {
        let grant = admit(&evaluator, "org", vec![2], quota, 3600).await;
        assert_eq!(grant.granted_unit_hashes, vec![2]);
    }

    let mut admitted = Vec::new();
    for hash in 10..110 {
        let grant = admit(&evaluator, "org", vec![hash], quota, 3600).await;
        if grant.is_empty() {
            assert_eq!(grant.reached_quota, Some(quota));
        } else {
            admitted.extend(grant.granted_unit_hashes);
        }
    }
    assert_eq!(admitted, (10..18).collect::<Vec<u64>>());

    // One full window later only hashes from the 3600 bucket have aged out
    let mut admitted = Vec::new();
    for hash in 10..110 {
        let grant = admit(&evaluator, "org", vec![hash], quota, 7200).await;
        admitted.extend(grant.granted_unit_hashes);
    }
    assert_eq!(admitted, (10..20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_steady_then_bursty_arrival() {
    let evaluator = evaluator();
    let quota = hourly(10);
    let mut hash = 0u64;

    // Arrivals every 360s match the replenishment rate of 10 per 3600s
    let mut last = 3600;
    for i in 0..100 {
        last = 3600 + i * 360;
        hash += 1;
        let grant = admit(&evaluator, "steady", vec![hash], quota, last).await;
        assert_eq!(grant.granted_unit_hashes, vec![hash], "insertion {} denied", i);
    }

    // Ten times faster: one slot frees up every ten arrivals
    let mut outcomes = Vec::new();
    for j in 1..=100 {
        hash += 1;
        let grant = admit(&evaluator, "steady", vec![hash], quota, last + j * 36).await;
        outcomes.push(!grant.is_empty());
    }

    for (index, admitted) in outcomes.iter().enumerate() {
        assert_eq!(*admitted, (index + 1) % 10 == 0, "insertion {}", index + 1);
    }
    assert_eq!(outcomes.iter().filter(|admitted| **admitted).count(), 10);
}

#[tokio::test]
async fn test_readmission_is_idempotent() {
    let evaluator = evaluator();
    let quota = hourly(3);

    let first = admit(&evaluator, "org", vec![5, 6, 7], quota, 3600).await;
    assert_eq!(first.granted_unit_hashes, vec![5, 6, 7]);

    // Known hashes are granted in any order even with the quota exhausted
    let again = admit(&evaluator, "org", vec![7, 8, 5, 6], quota, 3660).await;
    assert_eq!(again.granted_unit_hashes, vec![7, 5, 6]);
    assert_eq!(again.reached_quota, Some(quota));

    let usage = evaluator.usage("org", &quota, Some(3660)).await.unwrap().unwrap();
    assert_eq!(usage.estimated_cardinality, 3);
    assert_eq!(usage.remaining, 0);
}

#[tokio::test]
async fn test_batch_requests_share_no_state() {
    let evaluator = evaluator();
    let quota = hourly(2);

    let requests = vec![
        RequestedQuota::new("a", vec![1, 2, 3], vec![quota]),
        RequestedQuota::new("b", vec![1, 2, 3], vec![quota]),
    ];
    let (timestamp, grants) = evaluator.check_within_quotas(&requests, Some(3600)).await;
    assert_eq!(grants.len(), 2);
    assert_eq!(grants[0].prefix, "a");
    assert_eq!(grants[0].granted_unit_hashes, vec![1, 2]);
    assert_eq!(grants[1].prefix, "b");
    assert_eq!(grants[1].granted_unit_hashes, vec![1, 2]);

    evaluator.use_quotas(&grants, timestamp).await;
    let usage = evaluator.usage("a", &quota, Some(timestamp)).await.unwrap().unwrap();
    assert_eq!(usage.estimated_cardinality, 2);
}

#[tokio::test]
async fn test_batch_requests_for_one_prefix_share_budget() {
    let evaluator = evaluator();
    let quota = hourly(1);

    let requests = vec![
        RequestedQuota::new("org", vec![1], vec![quota]),
        RequestedQuota::new("org", vec![2], vec![quota]),
    ];
    let (timestamp, grants) = evaluator.check_within_quotas(&requests, Some(3600)).await;
    assert_eq!(grants[0].granted_unit_hashes, vec![1]);
    assert!(grants[1].is_empty());

    evaluator.use_quotas(&grants, timestamp).await;
    let usage = evaluator.usage("org", &quota, Some(timestamp)).await.unwrap().unwrap();
    assert_eq!(usage.estimated_cardinality, 1);
}

#[tokio::test]
async fn test_uncommitted_grants_do_not_count() {
    let evaluator = evaluator();
    let quota = hourly(1);

    let request = RequestedQuota::new("org", vec![1], vec![quota]);
    let (_, first) = evaluator.check_within_quotas(&[request], Some(3600)).await;
    assert_eq!(first[0].granted_unit_hashes, vec![1]);

    // The first grant was never committed, so another hash still fits
    let grant = admit(&evaluator, "org", vec![2], quota, 3600).await;
    assert_eq!(grant.granted_unit_hashes, vec![2]);
    let grant = admit(&evaluator, "org", vec![1], quota, 3600).await;
    assert!(grant.is_empty());
}

#[tokio::test]
async fn test_expiry_is_per_bucket() {
    let evaluator = evaluator();
    let quota = Quota::new(600, 300, 1).unwrap();

    // Lands in the bucket starting at 3600
    admit(&evaluator, "org", vec![1], quota, 3899).await;

    // 4199 - 600 = 3599 < 3600, bucket still live
    let grant = admit(&evaluator, "org", vec![2], quota, 4199).await;
    assert!(grant.is_empty());

    // At 4200 the 3600 bucket leaves the window as a whole
    let grant = admit(&evaluator, "org", vec![2], quota, 4200).await;
    assert_eq!(grant.granted_unit_hashes, vec![2]);
}

#[tokio::test]
async fn test_zero_limit_denies_new_hashes() {
    let evaluator = evaluator();
    let grant = admit(&evaluator, "org", vec![1, 2], hourly(0), 3600).await;
    assert!(grant.is_empty());
    assert_eq!(grant.reached_quota, Some(hourly(0)));
}

#[tokio::test]
async fn test_quotas_with_same_window_share_usage() {
    let evaluator = evaluator();
    let small = hourly(2);
    let large = hourly(5);

    admit(&evaluator, "org", vec![1, 2], large, 3600).await;
    let grant = admit(&evaluator, "org", vec![3], small, 3600).await;
    assert!(grant.is_empty());
    let grant = admit(&evaluator, "org", vec![3], large, 3600).await;
    assert_eq!(grant.granted_unit_hashes, vec![3]);
}

#[tokio::test]
async fn test_evaluators_over_one_store_agree() {
    let store: Arc<dyn QuotaStore> = Arc::new(MemoryStore::new());
    let first = QuotaEvaluator::new(store.clone(), ShardRouter::default());
    let second = QuotaEvaluator::new(store, ShardRouter::default());
    let quota = hourly(2);

    admit(&first, "org", vec![1, 2], quota, 3600).await;
    let grant = admit(&second, "org", vec![3], quota, 3600).await;
    assert!(grant.is_empty());
    let grant = admit(&second, "org", vec![2], quota, 3600).await;
    assert_eq!(grant.granted_unit_hashes, vec![2]);
}

#[tokio::test]
async fn test_sampling_saturates_early() {
    let store: Arc<dyn QuotaStore> = Arc::new(MemoryStore::new());
    let router = ShardRouter::new(4, 1).unwrap();
    let evaluator = QuotaEvaluator::new(store.clone(), router);
    let quota = hourly(10);

    let mut admitted = 0;
    for hash in 0..50 {
        let grant = admit(&evaluator, "hot", vec![hash], quota, 3600).await;
        admitted += grant.len();
    }
    // Every stored hash counts as four: saturation after ceil(10 / 4)
    assert_eq!(admitted, 3);

    let usage = evaluator.usage("hot", &quota, Some(3600)).await.unwrap().unwrap();
    assert_eq!(usage.estimated_cardinality, 12);
    assert_eq!(usage.remaining, 0);

    let counter = SlidingWindowCounter::new(store, router);
    assert_eq!(counter.window_keys("hot", &quota, 3600).len(), 60);
}

#[tokio::test]
async fn test_disabled_evaluator_grants_everything() {
    let evaluator = QuotaEvaluator::noop();
    let grant = admit(&evaluator, "org", (0..1000).collect(), hourly(1), 3600).await;
    assert_eq!(grant.len(), 1000);
    assert!(!grant.fail_open);
    assert!(grant.reached_quota.is_none());
}
