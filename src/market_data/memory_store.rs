use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::errors::StoreError;
use crate::market_data::store::{
    CandleStore, IndicatorRecord, IndicatorStore, UpsertSummary,
};
use crate::market_data::{truncate_to_minute, Candle};

type IndicatorKey = (String, String, String);

// ---------------------------------------------------------------------------
// MemoryCandleStore -- thread-safe ordered map per market
// ---------------------------------------------------------------------------

/// In-process candle and indicator store.
///
/// Candles live in one `BTreeMap` per market keyed by epoch seconds, which
/// gives the (market, minute) uniqueness and ascending iteration for free.
/// Used by tests and by single-process deployments that don't need
/// durability.
#[derive(Default)]
pub struct MemoryCandleStore {
    candles: RwLock<HashMap<String, BTreeMap<i64, Candle>>>,
    indicators: RwLock<HashMap<IndicatorKey, BTreeMap<i64, IndicatorRecord>>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows stored for `market` (placeholders included).
    pub fn count(&self, market: &str) -> usize {
        self.candles.read().get(market).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn get_range(
        &self,
        market: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>, StoreError> {
        let map = self.candles.read();
        let Some(series) = map.get(market) else {
            return Ok(Vec::new());
        };

        let lo = from.map_or(i64::MIN, |t| t.timestamp());
        let hi = to.map_or(i64::MAX, |t| t.timestamp());
        if lo > hi {
            return Ok(Vec::new());
        }

        let range = series.range(lo..=hi);
        let rows: Vec<Candle> = match limit {
            Some(n) => {
                let mut newest: Vec<Candle> = range.rev().take(n).map(|(_, c)| c.clone()).collect();
                newest.reverse();
                newest
            }
            None => range.map(|(_, c)| c.clone()).collect(),
        };
        Ok(rows)
    }

    async fn exists_minutes(
        &self,
        market: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeSet<DateTime<Utc>>, StoreError> {
        let map = self.candles.read();
        let (lo, hi) = (from.timestamp(), to.timestamp());
        if lo > hi {
            return Ok(BTreeSet::new());
        }
        Ok(map
            .get(market)
            .map(|series| series.range(lo..=hi).map(|(_, c)| c.timestamp).collect())
            .unwrap_or_default())
    }

    async fn bulk_upsert(&self, rows: Vec<Candle>) -> Result<UpsertSummary, StoreError> {
        let mut map = self.candles.write();
        let mut summary = UpsertSummary::default();

        for mut candle in rows {
            candle.timestamp = truncate_to_minute(candle.timestamp);
            let series = map.entry(candle.market.clone()).or_default();
            match series.insert(candle.timestamp.timestamp(), candle) {
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
        }

        Ok(summary)
    }
}

#[async_trait]
impl IndicatorStore for MemoryCandleStore {
    async fn upsert_indicators(
        &self,
        rows: Vec<IndicatorRecord>,
    ) -> Result<UpsertSummary, StoreError> {
        let mut map = self.indicators.write();
        let mut summary = UpsertSummary::default();

        for row in rows {
            let key = (row.market.clone(), row.indicator.clone(), row.params.clone());
            let series = map.entry(key).or_default();
            match series.insert(row.timestamp.timestamp(), row) {
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
        }

        Ok(summary)
    }

    async fn indicator_series(
        &self,
        market: &str,
        indicator: &str,
        params: &str,
    ) -> Result<Vec<IndicatorRecord>, StoreError> {
        let map = self.indicators.read();
        let key = (market.to_string(), indicator.to_string(), params.to_string());
        Ok(map
            .get(&key)
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
