// =============================================================================
// Keltner Channel
// =============================================================================
//
//   middle = EMA(close, ema_period)
//   upper  = middle + multiplier · ATR(atr_period)
//   lower  = middle - multiplier · ATR(atr_period)
//
// Rows start where the ATR does (index `atr_period - 1`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;
use crate::indicators::atr::atr_series;
use crate::indicators::ema::ema_series;
use crate::indicators::{require_candle_count, require_period, require_positive, tail, Smoothing};
use crate::market_data::PriceBar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeltnerParams {
    pub ema_period: usize,
    pub atr_period: usize,
    pub multiplier: f64,
    pub atr_smoothing: Smoothing,
}

impl Default for KeltnerParams {
    fn default() -> Self {
        Self {
            ema_period: 20,
            atr_period: 10,
            multiplier: 2.0,
            atr_smoothing: Smoothing::Wilder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeltnerRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

pub fn calculate_keltner(
    bars: &[PriceBar],
    params: &KeltnerParams,
    candle_count: usize,
) -> Result<Vec<KeltnerRow>, IndicatorError> {
    require_period("keltner", "ema_period", params.ema_period, 1)?;
    require_period("keltner", "atr_period", params.atr_period, 1)?;
    require_positive("keltner", "multiplier", params.multiplier)?;
    require_candle_count("keltner", candle_count)?;

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let middle = ema_series(&closes, params.ema_period);
    let atr = atr_series(bars, params.atr_period, params.atr_smoothing);

    let rows = bars
        .iter()
        .zip(middle.into_iter().zip(atr))
        .filter_map(|(bar, (mid, atr))| {
            let band = params.multiplier * atr?;
            Some(KeltnerRow {
                timestamp: bar.timestamp,
                close: bar.close,
                middle: mid,
                upper: mid + band,
                lower: mid - band,
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
    fn channel_is_symmetric_around_ema() {
        let rows = calculate_keltner(&ramp_then_decline(), &KeltnerParams::default(), 500).unwrap();
        assert_eq!(rows.len(), 200 - 9);
        for r in &rows {
            assert!(r.upper > r.middle && r.middle > r.lower);
            assert!(((r.upper - r.middle) - (r.middle - r.lower)).abs() < 1e-9);
        }
    }

    #[test]
    fn flat_market_band_is_multiplier_times_range() {
        let rows = calculate_keltner(&bars_from_closes(&[50.0; 30]), &KeltnerParams::default(), 1).unwrap();
        let r = &rows[0];
        assert!((r.upper - 52.0).abs() < 1e-12);
        assert!((r.lower - 48.0).abs() < 1e-12);
    }

    #[test]
    fn wilder_and_simple_atr_produce_different_channels() {
        let bars = ramp_then_decline();
        let wilder = calculate_keltner(&bars, &KeltnerParams::default(), 50).unwrap();
        let simple = calculate_keltner(
            &bars,
            &KeltnerParams {
                atr_smoothing: Smoothing::Simple,
                ..KeltnerParams::default()
            },
            50,
        )
        .unwrap();
        assert!(wilder.iter().zip(&simple).any(|(w, s)| (w.upper - s.upper).abs() > 1e-9));
    }

    #[test]
    fn rejects_non_positive_multiplier() {
        let params = KeltnerParams {
            multiplier: 0.0,
            ..KeltnerParams::default()
        };
        assert!(calculate_keltner(&[], &params, 10).is_err());
    }
}
