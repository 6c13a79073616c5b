use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One stored minute of market data.
///
/// Price and volume fields are nullable: a row whose prices are all `None` is
/// a *placeholder* recording a minute for which the exchange confirmed it has
/// no data. A placeholder is never re-fetched, and it is distinct from a
/// minute that has no row at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub market: String,
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub acc_trade_value: Option<f64>,
    pub acc_trade_volume: Option<f64>,
}

impl Candle {
    /// Build a placeholder row for `timestamp` (truncated to the minute).
    pub fn placeholder(market: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            market: market.into(),
            timestamp: truncate_to_minute(timestamp),
            open: None,
            high: None,
            low: None,
            close: None,
            acc_trade_value: None,
            acc_trade_volume: None,
        }
    }

    /// `true` when every price field is null.
    pub fn is_placeholder(&self) -> bool {
        self.open.is_none() && self.high.is_none() && self.low.is_none() && self.close.is_none()
    }

    /// Convert into a fully-populated [`PriceBar`], or `None` when any field
    /// the indicators need is missing.
    pub fn bar(&self) -> Option<PriceBar> {
        Some(PriceBar {
            timestamp: self.timestamp,
            open: self.open?,
            high: self.high?,
            low: self.low?,
            close: self.close?,
            volume: self.acc_trade_volume.unwrap_or(0.0),
        })
    }
}

/// Dense OHLCV bar consumed by the indicator engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Minute arithmetic
// ---------------------------------------------------------------------------

/// One bar of the series.
pub fn one_minute() -> Duration {
    Duration::minutes(1)
}

/// Truncate seconds and sub-seconds to zero.
///
/// Works for any timezone whose offset is a whole number of minutes, which
/// covers every exchange reporting zone we deal with.
pub fn truncate_to_minute<Tz: TimeZone>(ts: DateTime<Tz>) -> DateTime<Tz> {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(60);
    let tz = ts.timezone();
    tz.timestamp_opt(floored, 0).single().unwrap_or(ts)
}

/// Round up to the next minute boundary (no-op when already aligned).
pub fn ceil_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = truncate_to_minute(ts);
    if truncated == ts {
        ts
    } else {
        truncated + one_minute()
    }
}

/// `true` when `ts` has zero seconds and zero sub-second precision.
pub fn is_minute_aligned(ts: &DateTime<Utc>) -> bool {
    ts.timestamp().rem_euclid(60) == 0 && ts.timestamp_subsec_nanos() == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
