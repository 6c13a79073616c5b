use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::cache::SharedCache;
use crate::errors::CacheError;

/// In-process [`SharedCache`] for single-node deployments and tests.
///
/// Expiry is evaluated lazily on access, against tokio's clock so paused-time
/// tests can advance it.
#[derive(Default)]
pub struct MemoryCache {
    flags: Mutex<HashMap<String, (String, Instant)>>,
    sorted: Mutex<HashMap<String, BTreeMap<i64, String>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a flag, if unexpired.
    pub fn flag(&self, key: &str) -> Option<String> {
        let flags = self.flags.lock();
        flags
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(v, _)| v.clone())
    }

    /// Number of members in a sorted set.
    pub fn sorted_len(&self, key: &str) -> usize {
        self.sorted.lock().get(key).map_or(0, BTreeMap::len)
    }

    /// Member stored under `score`.
    pub fn sorted_member(&self, key: &str, score: i64) -> Option<String> {
        self.sorted.lock().get(key).and_then(|s| s.get(&score).cloned())
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut flags = self.flags.lock();
        if let Some((_, expires)) = flags.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        flags.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_if_owner(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut flags = self.flags.lock();
        let owned = flags.get(key).is_some_and(|(holder, _)| holder == value);
        if owned {
            flags.remove(key);
        }
        Ok(owned)
    }

    async fn extend_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut flags = self.flags.lock();
        match flags.get_mut(key) {
            Some((holder, expires)) if holder.as_str() == value && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sorted_add(
        &self,
        key: &str,
        members: Vec<(i64, String)>,
    ) -> Result<usize, CacheError> {
        let mut sorted = self.sorted.lock();
        let set = sorted.entry(key.to_string()).or_default();
        let written = members.len();
        set.extend(members);
        Ok(written)
    }

    async fn sorted_scores(&self, key: &str, min: i64, max: i64) -> Result<Vec<i64>, CacheError> {
        if min > max {
            return Ok(Vec::new());
        }
        let sorted = self.sorted.lock();
        Ok(sorted
            .get(key)
            .map(|set| set.range(min..=max).map(|(s, _)| *s).collect())
            .unwrap_or_default())
    }

    async fn sorted_remove_below(&self, key: &str, min: i64) -> Result<usize, CacheError> {
        let mut sorted = self.sorted.lock();
        let Some(set) = sorted.get_mut(key) else {
            return Ok(0);
        };
        let kept = set.split_off(&min);
        let removed = set.len();
        *set = kept;
        Ok(removed)
    }
}
