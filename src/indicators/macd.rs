// =============================================================================
// MACD (Moving Average Convergence Divergence)
// =============================================================================
//
//   macd      = EMA(close, short) - EMA(close, long)
//   signal    = EMA(macd, signal)
//   histogram = macd - signal
//
// Every EMA is seeded with its first input, so rows exist from bar 0.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;
use crate::indicators::ema::ema_series;
use crate::indicators::{require_candle_count, require_period, tail};
use crate::market_data::PriceBar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacdParams {
    pub short_period: usize,
    pub long_period: usize,
    pub signal_period: usize,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self {
            short_period: 12,
            long_period: 26,
            signal_period: 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacdRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

pub fn calculate_macd(
    bars: &[PriceBar],
    params: &MacdParams,
    candle_count: usize,
) -> Result<Vec<MacdRow>, IndicatorError> {
    require_period("macd", "short_period", params.short_period, 1)?;
    require_period("macd", "long_period", params.long_period, 1)?;
    require_period("macd", "signal_period", params.signal_period, 1)?;
    require_candle_count("macd", candle_count)?;
    if params.short_period >= params.long_period {
        return Err(IndicatorError::InvalidParameter {
            indicator: "macd",
            parameter: "short_period",
            reason: format!(
                "must be less than long_period ({} >= {})",
                params.short_period, params.long_period
            ),
        });
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let short = ema_series(&closes, params.short_period);
    let long = ema_series(&closes, params.long_period);
    let macd: Vec<f64> = short.iter().zip(&long).map(|(s, l)| s - l).collect();
    let signal = ema_series(&macd, params.signal_period);

    let rows = bars
        .iter()
        .zip(macd.iter().zip(&signal))
        .map(|(bar, (&m, &s))| MacdRow {
            timestamp: bar.timestamp,
            close: bar.close,
            macd: m,
            signal: s,
            histogram: m - s,
        })
        .collect();
    Ok(tail(rows, candle_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::ramp_then_decline;

    #[test]
    fn histogram_is_macd_minus_signal() {
        let rows = calculate_macd(&ramp_then_decline(), &MacdParams::default(), 500).unwrap();
        assert_eq!(rows.len(), 200);
        for r in &rows {
            assert_eq!(r.histogram, r.macd - r.signal);
        }
    }

    #[test]
    fn macd_positive_in_uptrend_negative_in_downtrend() {
        let rows = calculate_macd(&ramp_then_decline(), &MacdParams::default(), 500).unwrap();
        assert!(rows[69].macd > 0.0);
        assert!(rows[139].macd < 0.0);
    }

    #[test]
    fn first_row_is_zero() {
        let rows = calculate_macd(&ramp_then_decline(), &MacdParams::default(), 500).unwrap();
        assert_eq!(rows[0].macd, 0.0);
        assert_eq!(rows[0].signal, 0.0);
    }

    #[test]
    fn rejects_short_not_below_long() {
        let params = MacdParams {
            short_period: 26,
            long_period: 26,
            signal_period: 9,
        };
        let err = calculate_macd(&[], &params, 10).unwrap_err();
        assert!(err.to_string().contains("short_period"));
    }
}
