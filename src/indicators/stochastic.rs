// =============================================================================
// Stochastic Oscillator (%K / %D)
// =============================================================================
//
//   %K = 100 · (close - lowest_low(k)) / (highest_high(k) - lowest_low(k))
//   %D = SMA(%K, d)
//
// A window whose high equals its low has no range to place the close in;
// %K is reported as the neutral midpoint 50 in that case.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;
use crate::indicators::{
    require_candle_count, require_period, rolling_max, rolling_mean, rolling_min, tail,
};
use crate::market_data::PriceBar;

const FLAT_RANGE_K: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StochasticParams {
    pub k_period: usize,
    pub d_period: usize,
}

impl Default for StochasticParams {
    fn default() -> Self {
        Self {
            k_period: 14,
            d_period: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StochasticRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub k: f64,
    pub d: f64,
}

/// %K aligned to `bars`; `None` until index `k_period - 1`.
pub fn percent_k_series(bars: &[PriceBar], k_period: usize) -> Vec<Option<f64>> {
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

    rolling_max(&highs, k_period)
        .into_iter()
        .zip(rolling_min(&lows, k_period))
        .zip(bars)
        .map(|((hh, ll), bar)| {
            let (hh, ll) = (hh?, ll?);
            let range = hh - ll;
            if range == 0.0 {
                Some(FLAT_RANGE_K)
            } else {
                Some(100.0 * (bar.close - ll) / range)
            }
        })
        .collect()
}

/// (%K, %D) aligned to `bars`; both present from index `k + d - 2`.
pub fn stochastic_series(
    bars: &[PriceBar],
    k_period: usize,
    d_period: usize,
) -> Vec<Option<(f64, f64)>> {
    let k = percent_k_series(bars, k_period);
    let mut d = vec![None; k.len()];

    // %D only averages defined %K values, which start at k_period - 1.
    if let Some(first) = k.iter().position(Option::is_some) {
        let defined: Vec<f64> = k[first..].iter().flatten().copied().collect();
        for (i, v) in rolling_mean(&defined, d_period).into_iter().enumerate() {
            d[first + i] = v;
        }
    }

    k.into_iter()
        .zip(d)
        .map(|(k, d)| Some((k?, d?)))
        .collect()
}

pub fn calculate_stochastic(
    bars: &[PriceBar],
    params: &StochasticParams,
    candle_count: usize,
) -> Result<Vec<StochasticRow>, IndicatorError> {
    require_period("stochastic", "k_period", params.k_period, 1)?;
    require_period("stochastic", "d_period", params.d_period, 1)?;
    require_candle_count("stochastic", candle_count)?;

    let rows = bars
        .iter()
        .zip(stochastic_series(bars, params.k_period, params.d_period))
        .filter_map(|(bar, kd)| {
            let (k, d) = kd?;
            Some(StochasticRow {
                timestamp: bar.timestamp,
                close: bar.close,
                k,
                d,
            })
        })
        .collect();
    Ok(tail(rows, candle_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::{bars_from_closes, ramp_then_decline};

    #[test]
    fn first_row_at_k_plus_d_minus_two() {
        let bars = ramp_then_decline();
        let series = stochastic_series(&bars, 14, 3);
        assert!(series[..15].iter().all(Option::is_none));
        assert!(series[15].is_some());
    }

    #[test]
    fn values_stay_in_range() {
        let bars = ramp_then_decline();
        for (k, d) in stochastic_series(&bars, 14, 3).into_iter().flatten() {
            assert!((0.0..=100.0).contains(&k), "k {k}");
            assert!((0.0..=100.0).contains(&d), "d {d}");
        }
    }

    #[test]
    fn flat_range_is_neutral() {
        let mut bars = bars_from_closes(&[10.0; 20]);
        for b in &mut bars {
            b.high = 10.0;
            b.low = 10.0;
        }
        let rows = calculate_stochastic(&bars, &StochasticParams::default(), 100).unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r.k == 50.0 && r.d == 50.0));
    }

    #[test]
    fn close_at_window_high_reads_near_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let rows = calculate_stochastic(&bars_from_closes(&closes), &StochasticParams::default(), 1).unwrap();
        // close = high - 0.5, low of window = first close - 0.5
        let last = &rows[0];
        let expected = 100.0 * (30.0 - 16.5) / (30.5 - 16.5);
        assert!((last.k - expected).abs() < 1e-9);
    }

    #[test]
    fn rejects_zero_periods() {
        let bad = StochasticParams {
            k_period: 14,
            d_period: 0,
        };
        assert!(calculate_stochastic(&[], &bad, 10).is_err());
    }
}
