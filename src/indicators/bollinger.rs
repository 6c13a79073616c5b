// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(close, period)
// upper  = middle + deviation · σ
// lower  = middle - deviation · σ
// bandwidth = (upper - lower) / middle
//
// σ is the *sample* standard deviation of the window (n - 1 denominator),
// which is why `period` must be at least 2.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;
use crate::indicators::{require_candle_count, require_period, require_positive, tail};
use crate::market_data::PriceBar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BollingerParams {
    pub period: usize,
    pub deviation: f64,
}

impl Default for BollingerParams {
    fn default() -> Self {
        Self {
            period: 20,
            deviation: 2.0,
        }
    }
}

/// One Bollinger row. `bandwidth` is `None` when the middle band is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BollingerRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub bandwidth: Option<f64>,
}

/// (mean, sample σ) of one window.
fn mean_and_sample_std(window: &[f64]) -> (f64, f64) {
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let var = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

pub fn calculate_bollinger(
    bars: &[PriceBar],
    params: &BollingerParams,
    candle_count: usize,
) -> Result<Vec<BollingerRow>, IndicatorError> {
    require_period("bollinger", "period", params.period, 2)?;
    require_positive("bollinger", "deviation", params.deviation)?;
    require_candle_count("bollinger", candle_count)?;

    if bars.len() < params.period {
        return Ok(Vec::new());
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let rows = closes
        .windows(params.period)
        .zip(&bars[params.period - 1..])
        .map(|(window, bar)| {
            let (middle, std) = mean_and_sample_std(window);
            let upper = middle + params.deviation * std;
            let lower = middle - params.deviation * std;
            BollingerRow {
                timestamp: bar.timestamp,
                close: bar.close,
                upper,
                middle,
                lower,
                bandwidth: (middle != 0.0).then(|| (upper - lower) / middle),
            }
        })
        .collect();
    Ok(tail(rows, candle_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::{bars_from_closes, ramp_then_decline};

    #[test]
    fn bollinger_ordering() {
        let rows = calculate_bollinger(&ramp_then_decline(), &BollingerParams::default(), 500).unwrap();
        assert_eq!(rows.len(), 200 - 19);
        for r in &rows {
            assert!(r.upper > r.middle && r.middle > r.lower, "{r:?}");
        }
    }

    #[test]
    fn bollinger_uses_sample_std() {
        // closes 1..=4: mean 2.5, sample variance 5/3
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0]);
        let params = BollingerParams {
            period: 4,
            deviation: 1.0,
        };
        let row = &calculate_bollinger(&bars, &params, 1).unwrap()[0];
        assert!((row.middle - 2.5).abs() < 1e-12);
        assert!((row.upper - (2.5 + (5.0f64 / 3.0).sqrt())).abs() < 1e-12);
    }

    #[test]
    fn bollinger_flat_has_zero_width() {
        let rows = calculate_bollinger(&bars_from_closes(&[100.0; 20]), &BollingerParams::default(), 5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bandwidth, Some(0.0));
    }

    #[test]
    fn bollinger_zero_middle_has_no_bandwidth() {
        let bars = bars_from_closes(&[-1.0, 1.0, -1.0, 1.0]);
        let params = BollingerParams {
            period: 2,
            deviation: 2.0,
        };
        let rows = calculate_bollinger(&bars, &params, 10).unwrap();
        assert!(rows.iter().all(|r| r.bandwidth.is_none()));
    }

    #[test]
    fn bollinger_insufficient_data() {
        let rows = calculate_bollinger(&bars_from_closes(&[1.0, 2.0, 3.0]), &BollingerParams::default(), 10).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn bollinger_rejects_period_one_and_bad_deviation() {
        let one = BollingerParams {
            period: 1,
            deviation: 2.0,
        };
        assert!(calculate_bollinger(&[], &one, 10).is_err());
        let neg = BollingerParams {
            period: 20,
            deviation: -2.0,
        };
        assert!(calculate_bollinger(&[], &neg, 10).is_err());
    }
}
