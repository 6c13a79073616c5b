// =============================================================================
// Store contracts
// =============================================================================
//
// The candle store is an abstract time-indexed table keyed by
// (market, minute). Every implementation enforces that key as unique and
// applies writes with upsert semantics: a second write for the same key
// replaces the first.
// =============================================================================

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::market_data::Candle;

/// Outcome of a bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    /// Rows whose key did not exist before the write.
    pub inserted: usize,
    /// Rows whose key already existed and were overwritten.
    pub updated: usize,
}

impl UpsertSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Per-market, per-minute OHLCV table.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Rows for `market` with `from <= timestamp <= to`, ascending.
    ///
    /// With a `limit`, the **most recent** `limit` rows of that range are
    /// returned (still ascending).
    async fn get_range(
        &self,
        market: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>, StoreError>;

    /// Every timestamp in `[from, to]` that has a row (placeholders included).
    async fn exists_minutes(
        &self,
        market: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeSet<DateTime<Utc>>, StoreError>;

    /// Insert-or-replace all `rows` in a single write.
    async fn bulk_upsert(&self, rows: Vec<Candle>) -> Result<UpsertSummary, StoreError>;
}

/// A derived indicator value persisted for downstream consumers.
///
/// Unique per (market, timestamp, indicator, params).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub market: String,
    pub timestamp: DateTime<Utc>,
    /// Indicator kind, e.g. `"rsi"`.
    pub indicator: String,
    /// Canonical parameter set, e.g. `"period=14;mode=wilder"`.
    pub params: String,
    /// Indicator-specific values.
    pub values: serde_json::Value,
}

/// Upsert-only sink for derived indicator rows.
#[async_trait]
pub trait IndicatorStore: Send + Sync {
    async fn upsert_indicators(
        &self,
        rows: Vec<IndicatorRecord>,
    ) -> Result<UpsertSummary, StoreError>;

    /// Stored rows for one (market, indicator, params) series, ascending.
    async fn indicator_series(
        &self,
        market: &str,
        indicator: &str,
        params: &str,
    ) -> Result<Vec<IndicatorRecord>, StoreError>;
}
