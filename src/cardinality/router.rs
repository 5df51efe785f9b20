//! Shard Router
//!
//! Spreads one prefix's hashes over `num_shards` logical shards folded onto
//! `num_physical_shards` store partitions. When there are fewer physical than
//! logical shards the stored counts are scaled by
//! `num_shards / num_physical_shards` to estimate the prefix's cardinality.
//!
//! The estimate uses the count *before* an admission, so under sampling a
//! single admission moves it by the whole factor and the quota can saturate
//! after `ceil(limit / factor)` real admissions. This over-estimate is the
//! accepted price of keeping hot prefixes off a single counter.

use sha2::{Digest, Sha256};

use super::error::{QuotaError, Result};

/// Where a hash lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardAssignment {
    /// Logical shard in `[0, num_shards)`
    pub logical: u32,

    /// Physical partition in `[0, num_physical_shards)`
    pub physical: u32,
}

/// Maps hashes onto shards and turns stored counts into estimates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    num_shards: u32,
    num_physical_shards: u32,
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self {
            num_shards: 1,
            num_physical_shards: 1,
        }
    }
}

impl ShardRouter {
    /// Create a new router
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` unless `0 < num_physical_shards <= num_shards`.
    pub fn new(num_shards: u32, num_physical_shards: u32) -> Result<Self> {
        if num_shards == 0 {
            return Err(QuotaError::InvalidConfig(
                "cluster_num_shards must be greater than 0".to_string(),
            ));
        }
        if num_physical_shards == 0 {
            return Err(QuotaError::InvalidConfig(
                "cluster_num_physical_shards must be greater than 0".to_string(),
            ));
        }
        if num_physical_shards > num_shards {
            return Err(QuotaError::InvalidConfig(format!(
                "cluster_num_physical_shards ({}) cannot exceed cluster_num_shards ({})",
                num_physical_shards, num_shards
            )));
        }

        Ok(Self {
            num_shards,
            num_physical_shards,
        })
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn num_physical_shards(&self) -> u32 {
        self.num_physical_shards
    }

    /// Whether counts are being extrapolated
    pub fn is_sampling(&self) -> bool {
        self.num_physical_shards < self.num_shards
    }

    /// Factor applied to stored counts
    pub fn extrapolation_factor(&self) -> f64 {
        self.num_shards as f64 / self.num_physical_shards as f64
    }

    /// Route a hash of `prefix` to its shards
    ///
    /// Stable across processes and builds: SHA-256 over the prefix and the
    /// big-endian hash, first eight digest bytes read as a big-endian integer.
    pub fn route(&self, prefix: &str, unit_hash: u64) -> ShardAssignment {
        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());
        hasher.update([0u8]);
        hasher.update(unit_hash.to_be_bytes());
        let digest = hasher.finalize();

        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let logical = (u64::from_be_bytes(head) % self.num_shards as u64) as u32;

        ShardAssignment {
            logical,
            physical: logical % self.num_physical_shards,
        }
    }

    /// Estimated cardinality for a stored distinct count
    pub fn estimate(&self, stored_count: u64) -> u64 {
        let scaled = stored_count as u128 * self.num_shards as u128;
        let physical = self.num_physical_shards as u128;
        scaled.div_ceil(physical).min(u64::MAX as u128) as u64
    }

    /// Whether one more new hash may be admitted on top of `stored_count`
    ///
    /// Exact integer form of `stored_count * factor < limit`.
    pub fn admits(&self, stored_count: u64, limit: u64) -> bool {
        (stored_count as u128 * self.num_shards as u128)
            < (limit as u128 * self.num_physical_shards as u128)
    }

    /// New hashes that can still be admitted on top of `stored_count`
    pub fn remaining(&self, stored_count: u64, limit: u64) -> u64 {
        // Smallest count c with c * shards >= limit * physical is the saturation point
        let saturation =
            (limit as u128 * self.num_physical_shards as u128).div_ceil(self.num_shards as u128);
        (saturation.saturating_sub(stored_count as u128)).min(u64::MAX as u128) as u64
    }
}
