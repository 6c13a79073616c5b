// =============================================================================
// Shared cache contract
// =============================================================================
//
// The secondary cache plays two roles:
//   - a mutual-exclusion flag for backfill passes (set-if-absent with expiry,
//     released compare-and-delete by the owning token), and
//   - a time-sorted mirror of persisted candles (score = epoch seconds, at
//     most one member per score).
// =============================================================================

pub mod memory;
pub mod redis_cache;
pub mod sync;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::CacheError;

pub use self::memory::MemoryCache;
pub use self::redis_cache::RedisCache;
pub use self::sync::{CacheReconcileReport, CacheSynchronizer, CandleSnapshot};

#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Store `value` under `key` only if the key is absent. Returns whether
    /// the value was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;

    /// Delete `key` only while it still holds `value`. Returns whether a
    /// delete happened.
    async fn release_if_owner(&self, key: &str, value: &str) -> Result<bool, CacheError>;

    /// Reset the expiry of `key` to `ttl` only while it still holds `value`.
    /// Returns whether the flag is still owned.
    async fn extend_if_owner(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;

    /// Add `(score, member)` pairs to the sorted set at `key`, replacing any
    /// member already stored under the same score. Returns pairs written.
    async fn sorted_add(&self, key: &str, members: Vec<(i64, String)>)
        -> Result<usize, CacheError>;

    /// Scores present in `[min, max]`, ascending.
    async fn sorted_scores(&self, key: &str, min: i64, max: i64) -> Result<Vec<i64>, CacheError>;

    /// Remove every member with a score strictly below `min`. Returns the
    /// number removed.
    async fn sorted_remove_below(&self, key: &str, min: i64) -> Result<usize, CacheError>;
}
