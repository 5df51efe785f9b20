// Prometheus metrics for cardinality quota evaluation
//
// - Check latency (histogram)
// - Requests checked, hashes granted and denied (counters)
// - Fail-open requests and commit failures (counters)
//
// Metrics are always recorded; `init()` only registers them for export.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref QUOTA_CHECKS_TOTAL: IntCounter = IntCounter::new(
        "cardinality_quota_checks_total",
        "Total number of requests checked against cardinality quotas"
    ).expect("Failed to create quota checks metric");

    pub static ref QUOTA_CHECK_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("cardinality_quota_check_duration_seconds", "Duration of check_within_quotas batches")
    ).expect("Failed to create check duration metric");

    pub static ref HASHES_GRANTED_TOTAL: IntCounter = IntCounter::new(
        "cardinality_quota_hashes_granted_total",
        "Total number of unit hashes granted"
    ).expect("Failed to create hashes granted metric");

    pub static ref HASHES_DENIED_TOTAL: IntCounter = IntCounter::new(
        "cardinality_quota_hashes_denied_total",
        "Total number of unit hashes denied"
    ).expect("Failed to create hashes denied metric");

    pub static ref FAIL_OPEN_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cardinality_quota_fail_open_total", "Requests granted without consulting the store"),
        &["reason"]
    ).expect("Failed to create fail-open metric");

    pub static ref COMMIT_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "cardinality_quota_commit_failures_total",
        "Commits dropped after exhausting retries"
    ).expect("Failed to create commit failures metric");
}

/// Register all metrics with the registry
///
/// Safe to call more than once; metrics already registered are skipped.
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(QUOTA_CHECKS_TOTAL.clone()),
        Box::new(QUOTA_CHECK_DURATION_SECONDS.clone()),
        Box::new(HASHES_GRANTED_TOTAL.clone()),
        Box::new(HASHES_DENIED_TOTAL.clone()),
        Box::new(FAIL_OPEN_TOTAL.clone()),
        Box::new(COMMIT_FAILURES_TOTAL.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
