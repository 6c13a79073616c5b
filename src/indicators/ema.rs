// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_0      = close_0
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// Seeding with the first close (rather than an SMA of the first `period`
// closes) gives a value for every bar, so EMA rows start at bar 0.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;
use crate::indicators::{require_candle_count, require_period, tail};
use crate::market_data::PriceBar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaParams {
    pub period: usize,
}

impl Default for EmaParams {
    fn default() -> Self {
        Self { period: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub ema: f64,
}

/// EMA of `values`, one output per input.
///
/// # Edge cases
/// - `period == 0` or empty input => empty vec
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    if period == 0 {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(values.len());
    let mut prev = first;
    result.push(prev);
    for &v in &values[1..] {
        prev = v * multiplier + prev * (1.0 - multiplier);
        result.push(prev);
    }
    result
}

pub fn calculate_ema(
    bars: &[PriceBar],
    params: &EmaParams,
    candle_count: usize,
) -> Result<Vec<EmaRow>, IndicatorError> {
    require_period("ema", "period", params.period, 1)?;
    require_candle_count("ema", candle_count)?;

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let rows = bars
        .iter()
        .zip(ema_series(&closes, params.period))
        .map(|(bar, ema)| EmaRow {
            timestamp: bar.timestamp,
            close: bar.close,
            ema,
        })
        .collect();
    Ok(tail(rows, candle_count))
}
