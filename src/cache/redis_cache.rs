// =============================================================================
// Redis-backed shared cache
// =============================================================================
//
// Lock flag:    SET key token NX EX ttl
// Release:      Lua compare-and-delete, so a pass never frees a lock that
//               expired and was taken by someone else.
// Extend:       Lua compare-and-PEXPIRE, same ownership check.
// Sorted sets:  ZREMRANGEBYSCORE + ZADD per member inside one atomic
//               pipeline, keeping one member per score.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::info;

use crate::cache::SharedCache;
use crate::errors::CacheError;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    /// Open a multiplexed connection to `url` (e.g. `redis://127.0.0.1/0`).
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Redis cache connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_if_owner(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn extend_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended > 0)
    }

    async fn sorted_add(
        &self,
        key: &str,
        members: Vec<(i64, String)>,
    ) -> Result<usize, CacheError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (score, member) in &members {
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(*score)
                .arg(*score)
                .ignore();
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(members.len())
    }

    async fn sorted_scores(&self, key: &str, min: i64, max: i64) -> Result<Vec<i64>, CacheError> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(pairs.into_iter().map(|(_, score)| score as i64).collect())
    }

    async fn sorted_remove_below(&self, key: &str, min: i64) -> Result<usize, CacheError> {
        let mut conn = self.conn.clone();
        let removed: usize = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({min}"))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}
