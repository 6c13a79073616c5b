// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// True Range for each bar:
//   TR_0 = H - L                                   (no previous close)
//   TR_t = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR with the same dual-mode smoothing RSI
// uses (simple trailing mean or Wilder), first defined at `period - 1`.
// =============================================================================

use crate::indicators::{smoothed_average, Smoothing};
use crate::market_data::PriceBar;

/// True Range per bar, aligned to `bars`.
pub fn true_range(bars: &[PriceBar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let hl = bar.high - bar.low;
            match i.checked_sub(1).map(|p| bars[p].close) {
                Some(prev_close) => hl
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs()),
                None => hl,
            }
        })
        .collect()
}

/// ATR aligned to `bars`; `None` before index `period - 1`.
pub fn atr_series(bars: &[PriceBar], period: usize, smoothing: Smoothing) -> Vec<Option<f64>> {
    smoothed_average(&true_range(bars), period, smoothing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::bars_from_closes;

    #[test]
    fn first_true_range_is_high_minus_low() {
        let bars = bars_from_closes(&[10.0, 12.0]);
        let tr = true_range(&bars);
        assert_eq!(tr[0], 1.0);
        // |12.5 - 10| beats 12.5 - 11.5
        assert_eq!(tr[1], 2.5);
    }

    #[test]
    fn atr_alignment() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let atr = atr_series(&bars, 3, Smoothing::Wilder);
        assert!(atr[..2].iter().all(Option::is_none));
        assert!(atr[2..].iter().all(Option::is_some));
    }

    #[test]
    fn atr_constant_range() {
        let bars = bars_from_closes(&[100.0; 20]);
        for v in atr_series(&bars, 10, Smoothing::Simple).into_iter().flatten() {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn atr_empty_and_zero_period() {
        assert!(atr_series(&[], 14, Smoothing::Wilder).is_empty());
        let bars = bars_from_closes(&[1.0, 2.0]);
        assert!(atr_series(&bars, 0, Smoothing::Wilder).iter().all(Option::is_none));
    }
}
