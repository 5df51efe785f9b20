//! Cardinality Quota Library
//!
//! Sliding-window limits on the number of distinct values admitted per key,
//! evaluated against a shared store so any number of processes can enforce
//! the same quotas.

pub mod cardinality;
pub mod config;
pub mod logging;
pub mod metrics;

pub use cardinality::{
    Grant, LimiterConfig, MemoryStore, Quota, QuotaError, QuotaEvaluator, QuotaStore,
    RequestedQuota,
};
