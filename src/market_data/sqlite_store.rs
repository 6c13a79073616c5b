// =============================================================================
// SQLite candle store
// =============================================================================
//
// Durable implementation of the store contracts. Timestamps are stored as
// epoch seconds (always minute-aligned); (market, ts) is the primary key so
// the database itself rejects duplicate minutes. All statements run on the
// blocking pool through `spawn_blocking`, one connection behind a mutex.
// =============================================================================

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::market_data::store::{
    CandleStore, IndicatorRecord, IndicatorStore, UpsertSummary,
};
use crate::market_data::{truncate_to_minute, Candle};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candles (
    market            TEXT    NOT NULL,
    ts                INTEGER NOT NULL,
    open              REAL,
    high              REAL,
    low               REAL,
    close             REAL,
    acc_trade_value   REAL,
    acc_trade_volume  REAL,
    PRIMARY KEY (market, ts)
);

CREATE TABLE IF NOT EXISTS indicator_values (
    market     TEXT    NOT NULL,
    ts         INTEGER NOT NULL,
    indicator  TEXT    NOT NULL,
    params     TEXT    NOT NULL,
    payload    TEXT    NOT NULL,
    PRIMARY KEY (market, ts, indicator, params)
);
";

/// Candle and indicator store backed by a single SQLite database.
#[derive(Clone)]
pub struct SqliteCandleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCandleStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "candle store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

fn from_epoch(ts: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or(StoreError::InvalidTimestamp(ts))
}

fn read_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, [Option<f64>; 6])> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        [
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ],
    ))
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn get_range(
        &self,
        market: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>, StoreError> {
        let market = market.to_string();
        let lo = from.map_or(i64::MIN, |t| t.timestamp());
        let hi = to.map_or(i64::MAX, |t| t.timestamp());
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT market, ts, open, high, low, close, acc_trade_value, acc_trade_volume
                 FROM candles
                 WHERE market = ?1 AND ts >= ?2 AND ts <= ?3
                 ORDER BY ts DESC
                 LIMIT ?4",
            )?;
            let raw = stmt
                .query_map(params![market, lo, hi, limit], read_candle)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut rows = Vec::with_capacity(raw.len());
            for (market, ts, [open, high, low, close, value, volume]) in raw.into_iter().rev() {
                rows.push(Candle {
                    market,
                    timestamp: from_epoch(ts)?,
                    open,
                    high,
                    low,
                    close,
                    acc_trade_value: value,
                    acc_trade_volume: volume,
                });
            }
            Ok(rows)
        })
        .await
    }

    async fn exists_minutes(
        &self,
        market: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeSet<DateTime<Utc>>, StoreError> {
        let market = market.to_string();
        let (lo, hi) = (from.timestamp(), to.timestamp());

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ts FROM candles WHERE market = ?1 AND ts >= ?2 AND ts <= ?3",
            )?;
            let stamps = stmt
                .query_map(params![market, lo, hi], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            stamps.into_iter().map(from_epoch).collect()
        })
        .await
    }

    async fn bulk_upsert(&self, rows: Vec<Candle>) -> Result<UpsertSummary, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertSummary::default());
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut summary = UpsertSummary::default();
            {
                let mut exists = tx.prepare_cached(
                    "SELECT 1 FROM candles WHERE market = ?1 AND ts = ?2",
                )?;
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO candles
                        (market, ts, open, high, low, close, acc_trade_value, acc_trade_volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT (market, ts) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        acc_trade_value = excluded.acc_trade_value,
                        acc_trade_volume = excluded.acc_trade_volume",
                )?;

                for candle in &rows {
                    let ts = truncate_to_minute(candle.timestamp).timestamp();
                    let existed = exists
                        .query_row(params![candle.market, ts], |_| Ok(()))
                        .optional()?
                        .is_some();
                    upsert.execute(params![
                        candle.market,
                        ts,
                        candle.open,
                        candle.high,
                        candle.low,
                        candle.close,
                        candle.acc_trade_value,
                        candle.acc_trade_volume,
                    ])?;
                    if existed {
                        summary.updated += 1;
                    } else {
                        summary.inserted += 1;
                    }
                }
            }
            tx.commit()?;
            debug!(inserted = summary.inserted, updated = summary.updated, "candles upserted");
            Ok(summary)
        })
        .await
    }
}

#[async_trait]
impl IndicatorStore for SqliteCandleStore {
    async fn upsert_indicators(
        &self,
        rows: Vec<IndicatorRecord>,
    ) -> Result<UpsertSummary, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertSummary::default());
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut summary = UpsertSummary::default();
            {
                let mut exists = tx.prepare_cached(
                    "SELECT 1 FROM indicator_values
                     WHERE market = ?1 AND ts = ?2 AND indicator = ?3 AND params = ?4",
                )?;
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO indicator_values (market, ts, indicator, params, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (market, ts, indicator, params) DO UPDATE SET
                        payload = excluded.payload",
                )?;

                for row in &rows {
                    let ts = row.timestamp.timestamp();
                    let payload = serde_json::to_string(&row.values)?;
                    let existed = exists
                        .query_row(params![row.market, ts, row.indicator, row.params], |_| Ok(()))
                        .optional()?
                        .is_some();
                    upsert.execute(params![row.market, ts, row.indicator, row.params, payload])?;
                    if existed {
                        summary.updated += 1;
                    } else {
                        summary.inserted += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(summary)
        })
        .await
    }

    async fn indicator_series(
        &self,
        market: &str,
        indicator: &str,
        params: &str,
    ) -> Result<Vec<IndicatorRecord>, StoreError> {
        let (market, indicator, param_key) =
            (market.to_string(), indicator.to_string(), params.to_string());

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ts, payload FROM indicator_values
                 WHERE market = ?1 AND indicator = ?2 AND params = ?3
                 ORDER BY ts ASC",
            )?;
            let raw = stmt
                .query_map(params![market, indicator, param_key], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(ts, payload)| {
                    Ok(IndicatorRecord {
                        market: market.clone(),
                        timestamp: from_epoch(ts)?,
                        indicator: indicator.clone(),
                        params: param_key.clone(),
                        values: serde_json::from_str(&payload)?,
                    })
                })
                .collect()
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
