// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator transforms over an ascending window of
// `PriceBar`s. Each indicator exposes:
//   - an aligned `*_series` function (one `Option` per input bar, `None`
//     where there is not enough history yet), and
//   - a `calculate_*` entry point that validates parameters, drops the
//     leading rows without lookback and keeps the trailing `candle_count`.
//
// Parameters are validated before any computation; invalid values are an
// `IndicatorError`, never clamped. Too little data is not an error: the
// result is simply shorter (or empty).
// =============================================================================

pub mod analyzer;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod ichimoku;
pub mod keltner;
pub mod macd;
pub mod rsi;
pub mod stochastic;
pub mod vwap;

use serde::{Deserialize, Serialize};

use crate::errors::IndicatorError;

pub use analyzer::{
    default_catalogue, AnalysisReport, IndicatorOutput, IndicatorSeries, IndicatorSpec,
    NamedIndicator, TechnicalAnalyzer,
};

/// Averaging method shared by RSI and ATR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Smoothing {
    /// Plain trailing mean over the period.
    Simple,
    /// Seed with the simple mean, then `prev·(n-1)/n + current/n`.
    #[default]
    Wilder,
}

impl Smoothing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Wilder => "wilder",
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub(crate) fn require_period(
    indicator: &'static str,
    parameter: &'static str,
    value: usize,
    min: usize,
) -> Result<(), IndicatorError> {
    if value < min {
        return Err(IndicatorError::InvalidParameter {
            indicator,
            parameter,
            reason: format!("must be at least {min}, got {value}"),
        });
    }
    Ok(())
}

pub(crate) fn require_positive(
    indicator: &'static str,
    parameter: &'static str,
    value: f64,
) -> Result<(), IndicatorError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(IndicatorError::InvalidParameter {
            indicator,
            parameter,
            reason: format!("must be a positive finite number, got {value}"),
        });
    }
    Ok(())
}

pub(crate) fn require_candle_count(
    indicator: &'static str,
    candle_count: usize,
) -> Result<(), IndicatorError> {
    require_period(indicator, "candle_count", candle_count, 1)
}

// ---------------------------------------------------------------------------
// Rolling primitives
// ---------------------------------------------------------------------------

/// Trailing mean over `period` values, aligned to the input.
pub fn rolling_mean(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling(values, period, |w| w.iter().sum::<f64>() / w.len() as f64)
}

pub fn rolling_max(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling(values, period, |w| w.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn rolling_min(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling(values, period, |w| w.iter().copied().fold(f64::INFINITY, f64::min))
}

fn rolling<F>(values: &[f64], period: usize, f: F) -> Vec<Option<f64>>
where
    F: Fn(&[f64]) -> f64,
{
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    for (i, window) in values.windows(period).enumerate() {
        out[i + period - 1] = Some(f(window));
    }
    out
}

/// Smoothed average of `values` with the requested method.
///
/// Both methods produce their first value at index `period - 1`. Wilder is
/// an explicit left-to-right scan seeded with the simple mean of the first
/// `period` values.
///
/// # Edge cases
/// - `period == 0` or fewer than `period` values => all `None`
pub fn smoothed_average(values: &[f64], period: usize, mode: Smoothing) -> Vec<Option<f64>> {
    match mode {
        Smoothing::Simple => rolling_mean(values, period),
        Smoothing::Wilder => {
            let mut out = vec![None; values.len()];
            if period == 0 || values.len() < period {
                return out;
            }
            let n = period as f64;
            let mut avg = values[..period].iter().sum::<f64>() / n;
            out[period - 1] = Some(avg);
            for (i, &v) in values.iter().enumerate().skip(period) {
                avg = (avg * (n - 1.0) + v) / n;
                out[i] = Some(avg);
            }
            out
        }
    }
}

/// Keep only the last `candle_count` rows.
pub(crate) fn tail<T>(mut rows: Vec<T>, candle_count: usize) -> Vec<T> {
    if rows.len() > candle_count {
        rows.drain(..rows.len() - candle_count);
    }
    rows
}

// ---------------------------------------------------------------------------
// Shared fixtures
// ---------------------------------------------------------------------------


// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_mean_alignment() {
        let out = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(out, vec![None, Some(1.5), Some(2.5), Some(3.5)]);
    }

    #[test]
    fn rolling_extremes() {
        let v = [3.0, 1.0, 4.0, 1.0, 5.0];
        assert_eq!(rolling_max(&v, 3), vec![None, None, Some(4.0), Some(4.0), Some(5.0)]);
        assert_eq!(rolling_min(&v, 3), vec![None, None, Some(1.0), Some(1.0), Some(1.0)]);
    }

    #[test]
    fn rolling_short_input_is_all_none() {
        assert_eq!(rolling_mean(&[1.0], 3), vec![None]);
        assert!(rolling_mean(&[], 3).is_empty());
    }

    #[test]
    fn wilder_seeds_with_simple_mean_then_smooths() {
        let v = [2.0, 4.0, 6.0, 8.0];
        let out = smoothed_average(&v, 2, Smoothing::Wilder);
        assert_eq!(out[0], None);
        assert_eq!(out[1], Some(3.0));
        assert_eq!(out[2], Some((3.0 + 6.0) / 2.0));
        assert_eq!(out[3], Some((4.5 + 8.0) / 2.0));
    }

    #[test]
    fn simple_and_wilder_differ_on_varying_input() {
        let v = [1.0, 5.0, 2.0, 8.0, 3.0];
        let simple = smoothed_average(&v, 2, Smoothing::Simple);
        let wilder = smoothed_average(&v, 2, Smoothing::Wilder);
        assert_eq!(simple[1], wilder[1]);
        assert_ne!(simple[4], wilder[4]);
    }

    #[test]
    fn tail_keeps_most_recent() {
        assert_eq!(tail(vec![1, 2, 3, 4], 2), vec![3, 4]);
        assert_eq!(tail(vec![1, 2], 5), vec![1, 2]);
    }

    #[test]
    fn validation_messages() {
        assert!(require_period("rsi", "period", 0, 1).is_err());
        assert!(require_period("rsi", "period", 1, 1).is_ok());
        assert!(require_positive("bollinger", "deviation", f64::NAN).is_err());
        assert!(require_positive("bollinger", "deviation", -1.0).is_err());
        assert!(require_candle_count("ema", 0).is_err());
    }
}
