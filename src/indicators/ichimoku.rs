// =============================================================================
// Ichimoku Kinko Hyo
// =============================================================================
//
//   tenkan   = (highest high + lowest low) / 2 over `tenkan_period`
//   kijun    = (highest high + lowest low) / 2 over `kijun_period`
//   senkou A = (tenkan + kijun) / 2, plotted `kijun_period` bars ahead
//   senkou B = midpoint over `senkou_b_period`, plotted `kijun_period` ahead
//   chikou   = close plotted `kijun_period` bars behind
//
// Rows are aligned to the bar they are plotted on, so senkou A/B at bar i
// come from bar i - kijun and chikou at bar i is the close of bar i + kijun.
// Rows start once tenkan and kijun both exist; the shifted lines stay `None`
// where their source bar is outside the window.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;
use crate::indicators::{require_candle_count, require_period, rolling_max, rolling_min, tail};
use crate::market_data::PriceBar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IchimokuParams {
    pub tenkan_period: usize,
    pub kijun_period: usize,
    pub senkou_b_period: usize,
}

impl Default for IchimokuParams {
    fn default() -> Self {
        Self {
            tenkan_period: 9,
            kijun_period: 26,
            senkou_b_period: 52,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IchimokuRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub tenkan: f64,
    pub kijun: f64,
    pub senkou_a: Option<f64>,
    pub senkou_b: Option<f64>,
    pub chikou: Option<f64>,
}

fn midpoint_series(bars: &[PriceBar], period: usize) -> Vec<Option<f64>> {
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    rolling_max(&highs, period)
        .into_iter()
        .zip(rolling_min(&lows, period))
        .map(|(h, l)| Some((h? + l?) / 2.0))
        .collect()
}

pub fn calculate_ichimoku(
    bars: &[PriceBar],
    params: &IchimokuParams,
    candle_count: usize,
) -> Result<Vec<IchimokuRow>, IndicatorError> {
    require_period("ichimoku", "tenkan_period", params.tenkan_period, 1)?;
    require_period("ichimoku", "kijun_period", params.kijun_period, 1)?;
    require_period("ichimoku", "senkou_b_period", params.senkou_b_period, 1)?;
    require_candle_count("ichimoku", candle_count)?;

    let shift = params.kijun_period;
    let tenkan = midpoint_series(bars, params.tenkan_period);
    let kijun = midpoint_series(bars, params.kijun_period);
    let senkou_b_source = midpoint_series(bars, params.senkou_b_period);

    let mut rows = Vec::new();
    for (i, bar) in bars.iter().enumerate() {
        let (Some(t), Some(k)) = (tenkan[i], kijun[i]) else {
            continue;
        };
        let src = i.checked_sub(shift);
        let senkou_a = src.and_then(|j| Some((tenkan[j]? + kijun[j]?) / 2.0));
        let senkou_b = src.and_then(|j| senkou_b_source[j]);
        let chikou = bars.get(i + shift).map(|b| b.close);

        rows.push(IchimokuRow {
            timestamp: bar.timestamp,
            close: bar.close,
            tenkan: t,
            kijun: k,
            senkou_a,
            senkou_b,
            chikou,
        });
    }
    Ok(tail(rows, candle_count))
}
