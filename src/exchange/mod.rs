// =============================================================================
// Exchange client contract
// =============================================================================
//
// The backfill engine only ever asks one question of the upstream exchange:
// "give me up to N most-recent one-minute candles ending at T". Everything
// about wire formats, headers and throttling stays behind this trait.
// =============================================================================

pub mod rate_limit;
pub mod upbit;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FetchError;
use crate::market_data::{truncate_to_minute, Candle};

pub use rate_limit::{RemainingReq, RemainingReqTracker};
pub use upbit::UpbitClient;

/// One fully-populated candle as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandle {
    /// Start of the minute, UTC.
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub acc_trade_value: f64,
    pub acc_trade_volume: f64,
}

impl RawCandle {
    pub fn into_candle(self, market: impl Into<String>) -> Candle {
        Candle {
            market: market.into(),
            timestamp: truncate_to_minute(self.timestamp),
            open: Some(self.open),
            high: Some(self.high),
            low: Some(self.low),
            close: Some(self.close),
            acc_trade_value: Some(self.acc_trade_value),
            acc_trade_volume: Some(self.acc_trade_volume),
        }
    }
}

/// Result of a successful round-trip to the exchange.
///
/// "No data" is a normal answer, not an error: both `Empty` and `Malformed`
/// end up as placeholder rows after reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Candles(Vec<RawCandle>),
    Empty,
    Malformed(String),
}

impl FetchOutcome {
    /// Candles carried by the outcome (none for `Empty` / `Malformed`).
    pub fn into_candles(self) -> Vec<RawCandle> {
        match self {
            Self::Candles(c) => c,
            Self::Empty | Self::Malformed(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Candles(c) => c.len(),
            Self::Empty | Self::Malformed(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only market data source.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Stable provider name, used in lock and cache keys.
    fn provider(&self) -> &str;

    /// Fetch up to `count` one-minute candles strictly before `to`, newest
    /// first or in any order; callers index the result by timestamp.
    async fn fetch_recent(
        &self,
        market: &str,
        to: DateTime<Utc>,
        count: usize,
    ) -> Result<FetchOutcome, FetchError>;
}
