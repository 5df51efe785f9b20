//! Cardinality Quota Module
//!
//! Bounds how many distinct hashes may be admitted for a prefix within a
//! sliding time window.
//!
//! # Features
//!
//! - Two-phase check/commit API over batches of requests
//! - Sliding windows built from fixed granularity buckets with store-side TTLs
//! - Sharded storage for hot prefixes, with sampled estimation when there are
//!   fewer physical than logical shards
//! - Fail-open on store errors and a noop mode when disabled
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Quota Evaluator                         │
//! │        check_within_quotas  ──▶  Grant  ──▶  use_quotas      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐  ┌─────────────────────────┐  │
//! │  │  Sliding Window Counter  │──│      Shard Router       │  │
//! │  └──────────────────────────┘  └─────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │          Quota Store (shared, TTL buckets)           │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod evaluator;
pub mod quota;
pub mod retry;
pub mod router;
pub mod store;
pub mod window;

pub use config::LimiterConfig;
pub use error::QuotaError;
pub use evaluator::QuotaEvaluator;
pub use quota::{Grant, Quota, QuotaId, RequestedQuota, UsageStats};
pub use retry::RetryConfig;
pub use router::{ShardAssignment, ShardRouter};
pub use store::{BucketKey, MemoryStore, QuotaStore};
pub use window::SlidingWindowCounter;
