// =============================================================================
// Rolling VWAP
// =============================================================================
//
//   typical = (high + low + close) / 3
//   VWAP    = Σ(typical · volume) / Σ(volume)   over the trailing `period`
//
// A window with zero total volume has no defined VWAP and produces no row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;
use crate::indicators::{require_candle_count, require_period, tail};
use crate::market_data::PriceBar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VwapParams {
    pub period: usize,
}

impl Default for VwapParams {
    fn default() -> Self {
        Self { period: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VwapRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub vwap: f64,
}

pub fn calculate_vwap(
    bars: &[PriceBar],
    params: &VwapParams,
    candle_count: usize,
) -> Result<Vec<VwapRow>, IndicatorError> {
    require_period("vwap", "period", params.period, 1)?;
    require_candle_count("vwap", candle_count)?;

    if bars.len() < params.period {
        return Ok(Vec::new());
    }

    let rows = bars
        .windows(params.period)
        .filter_map(|window| {
            let volume: f64 = window.iter().map(|b| b.volume).sum();
            if volume == 0.0 {
                return None;
            }
            let pv: f64 = window
                .iter()
                .map(|b| (b.high + b.low + b.close) / 3.0 * b.volume)
                .sum();
            let last = window.last()?;
            Some(VwapRow {
                timestamp: last.timestamp,
                close: last.close,
                vwap: pv / volume,
            })
        })
        .collect();
    Ok(tail(rows, candle_count))
}
