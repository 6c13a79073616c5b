// =============================================================================
// Relative Strength Index (RSI) — simple or Wilder smoothing
// =============================================================================
//
// Step 1 — Price changes from consecutive closes:
//            gain = max(Δclose, 0),  loss = max(-Δclose, 0)
// Step 2 — Average gain / loss over `period` deltas, either
//            Simple: trailing mean, or
//            Wilder: seeded with the mean of the first `period` deltas, then
//                    avg = (prev · (period - 1) + current) / period
// Step 3 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// The first RSI value belongs to bar index `period` (bar 0 has no delta).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;
use crate::indicators::{require_candle_count, require_period, smoothed_average, tail, Smoothing};
use crate::market_data::PriceBar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsiParams {
    pub period: usize,
    pub smoothing: Smoothing,
}

impl Default for RsiParams {
    fn default() -> Self {
        Self {
            period: 14,
            smoothing: Smoothing::Wilder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub rsi: f64,
}

/// RSI aligned to `closes`; `None` until index `period`.
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` closes => all `None`
/// - Average loss of zero => exactly 100.0, including a perfectly flat
///   window (no losses means nothing pulls the index down)
pub fn rsi_series(closes: &[f64], period: usize, smoothing: Smoothing) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let (gains, losses): (Vec<f64>, Vec<f64>) = closes
        .windows(2)
        .map(|w| {
            let delta = w[1] - w[0];
            (delta.max(0.0), (-delta).max(0.0))
        })
        .unzip();

    let avg_gain = smoothed_average(&gains, period, smoothing);
    let avg_loss = smoothed_average(&losses, period, smoothing);

    // delta j describes bar j + 1
    for (j, (g, l)) in avg_gain.iter().zip(&avg_loss).enumerate() {
        if let (Some(g), Some(l)) = (g, l) {
            out[j + 1] = rsi_from_averages(*g, *l);
        }
    }
    out
}

/// Validated RSI rows for the trailing `candle_count` bars with history.
pub fn calculate_rsi(
    bars: &[PriceBar],
    params: &RsiParams,
    candle_count: usize,
) -> Result<Vec<RsiRow>, IndicatorError> {
    require_period("rsi", "period", params.period, 1)?;
    require_candle_count("rsi", candle_count)?;

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let rows = bars
        .iter()
        .zip(rsi_series(&closes, params.period, params.smoothing))
        .filter_map(|(bar, rsi)| {
            Some(RsiRow {
                timestamp: bar.timestamp,
                close: bar.close,
                rsi: rsi?,
            })
        })
        .collect();
    Ok(tail(rows, candle_count))
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.is_finite().then_some(rsi)
}
