// =============================================================================
// Cache Synchronizer — mirrors persisted candles into the shared cache
// =============================================================================
//
// Every real candle written to the store is published to the sorted set
// `{provider}:{market}:{timeframe}` with score = epoch seconds and a JSON
// snapshot as the member. Placeholders are never mirrored. A periodic
// reconciliation compares store timestamps with cache scores over a trailing
// window, republishes whatever the cache is missing, and trims entries older
// than the retention period.
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::SharedCache;
use crate::errors::{BackfillError, CacheError};
use crate::market_data::{Candle, CandleStore};

/// Cached OHLCV snapshot for one minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub acc_trade_value: f64,
    pub acc_trade_volume: f64,
}

impl CandleSnapshot {
    /// `None` for placeholders (and any row missing a price).
    pub fn from_candle(c: &Candle) -> Option<Self> {
        Some(Self {
            timestamp: c.timestamp,
            open: c.open?,
            high: c.high?,
            low: c.low?,
            close: c.close?,
            acc_trade_value: c.acc_trade_value.unwrap_or(0.0),
            acc_trade_volume: c.acc_trade_volume.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReconcileReport {
    pub market: String,
    /// Real candles in the store over the window.
    pub checked: usize,
    pub republished: usize,
    pub trimmed: usize,
}

pub struct CacheSynchronizer {
    cache: Arc<dyn SharedCache>,
    provider: String,
    timeframe: String,
    retention: Duration,
}

impl CacheSynchronizer {
    pub fn new(
        cache: Arc<dyn SharedCache>,
        provider: impl Into<String>,
        timeframe: impl Into<String>,
        retention: Duration,
    ) -> Self {
        Self {
            cache,
            provider: provider.into(),
            timeframe: timeframe.into(),
            retention,
        }
    }

    /// Sorted-set key for `market`.
    pub fn key(&self, market: &str) -> String {
        format!("{}:{}:{}", self.provider, market, self.timeframe)
    }

    /// Publish every real candle in `rows`; returns how many were written.
    pub async fn mirror(&self, rows: &[Candle]) -> Result<usize, CacheError> {
        let mut by_market: BTreeMap<&str, Vec<(i64, String)>> = BTreeMap::new();
        for candle in rows {
            let Some(snapshot) = CandleSnapshot::from_candle(candle) else {
                continue;
            };
            by_market
                .entry(candle.market.as_str())
                .or_default()
                .push((candle.timestamp.timestamp(), serde_json::to_string(&snapshot)?));
        }

        let mut written = 0;
        for (market, members) in by_market {
            written += self.cache.sorted_add(&self.key(market), members).await?;
        }
        if written > 0 {
            debug!(written, "candles mirrored to cache");
        }
        Ok(written)
    }

    /// Republish store rows the cache lacks over `[now - window, now]`, then
    /// trim entries older than the retention period.
    pub async fn reconcile(
        &self,
        store: &dyn CandleStore,
        market: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CacheReconcileReport, BackfillError> {
        let from = now - window;
        let key = self.key(market);

        let stored: Vec<Candle> = store
            .get_range(market, Some(from), Some(now), None)
            .await?
            .into_iter()
            .filter(|c| !c.is_placeholder())
            .collect();
        let cached: HashSet<i64> = self
            .cache
            .sorted_scores(&key, from.timestamp(), now.timestamp())
            .await?
            .into_iter()
            .collect();

        let missing: Vec<Candle> = stored
            .iter()
            .filter(|c| !cached.contains(&c.timestamp.timestamp()))
            .cloned()
            .collect();
        let republished = self.mirror(&missing).await?;

        let cutoff = (now - self.retention).timestamp();
        let trimmed = self.cache.sorted_remove_below(&key, cutoff).await?;

        let report = CacheReconcileReport {
            market: market.to_string(),
            checked: stored.len(),
            republished,
            trimmed,
        };
        info!(
            market,
            checked = report.checked,
            republished = report.republished,
            trimmed = report.trimmed,
            "cache reconciliation complete"
        );
        Ok(report)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
