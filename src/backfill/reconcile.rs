// =============================================================================
// Response reconciliation
// =============================================================================
//
// The exchange answers "N candles before T" with whatever it has: possibly
// fewer rows, possibly out of order. Reconciliation turns that answer into
// exactly `count` rows for the requested minutes so a batch is never
// re-detected as missing: matched minutes become full candles, unmatched
// minutes become placeholders, and entries outside the request are dropped.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::exchange::{FetchOutcome, RawCandle};
use crate::market_data::{truncate_to_minute, Candle};

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    /// Exactly `count` rows, ascending by timestamp.
    pub rows: Vec<Candle>,
    pub real: usize,
    pub placeholders: usize,
    /// Response entries that matched none of the requested minutes.
    pub ignored: usize,
}

/// Requested minutes for a batch ending at `end`, ascending.
///
/// The end bound is truncated in the exchange's reporting timezone, then
/// stepped back one minute at a time.
pub fn expected_minutes(
    end: DateTime<Utc>,
    count: usize,
    reporting_offset: FixedOffset,
) -> Vec<DateTime<Utc>> {
    let newest = truncate_to_minute(end.with_timezone(&reporting_offset)).with_timezone(&Utc);
    let mut minutes: Vec<_> = (0..count as i64)
        .map(|i| newest - Duration::minutes(i))
        .collect();
    minutes.reverse();
    minutes
}

pub fn reconcile(
    market: &str,
    end: DateTime<Utc>,
    count: usize,
    reporting_offset: FixedOffset,
    outcome: FetchOutcome,
) -> Reconciled {
    let mut by_minute: HashMap<DateTime<Utc>, RawCandle> = HashMap::new();
    let mut received = 0usize;
    for raw in outcome.into_candles() {
        received += 1;
        by_minute
            .entry(truncate_to_minute(raw.timestamp))
            .or_insert(raw);
    }

    let mut rows = Vec::with_capacity(count);
    let (mut real, mut placeholders) = (0, 0);
    for minute in expected_minutes(end, count, reporting_offset) {
        match by_minute.remove(&minute) {
            Some(raw) => {
                real += 1;
                rows.push(raw.into_candle(market));
            }
            None => {
                placeholders += 1;
                rows.push(Candle::placeholder(market, minute));
            }
        }
    }

    Reconciled {
        rows,
        real,
        placeholders,
        ignored: received - real,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 20, 0, 10, 0).unwrap()
    }

    fn raw(ts: DateTime<Utc>, close: f64) -> RawCandle {
        RawCandle {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            acc_trade_value: close,
            acc_trade_volume: 1.0,
        }
    }

    #[test]
    fn short_response_is_padded_with_placeholders() {
        let end = t() + Duration::seconds(1);
        let out = reconcile("KRW-BTC", end, 3, kst(), FetchOutcome::Candles(vec![raw(t(), 5.0)]));

        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.real, 1);
        assert_eq!(out.placeholders, 2);

        let stamps: Vec<_> = out.rows.iter().map(|c| c.timestamp).collect();
        assert_eq!(
            stamps,
            vec![t() - Duration::minutes(2), t() - Duration::minutes(1), t()]
        );
        assert!(out.rows[0].is_placeholder());
        assert!(out.rows[1].is_placeholder());
        assert_eq!(out.rows[2].close, Some(5.0));
    }

    #[test]
    fn count_five_always_spans_five_minutes() {
        let end = t() + Duration::seconds(1);
        for outcome in [
            FetchOutcome::Empty,
            FetchOutcome::Malformed("nope".into()),
            FetchOutcome::Candles((0..5).map(|i| raw(t() - Duration::minutes(i), 1.0)).collect()),
        ] {
            let out = reconcile("KRW-BTC", end, 5, kst(), outcome);
            assert_eq!(out.rows.len(), 5);
            assert_eq!(out.rows[0].timestamp, t() - Duration::minutes(4));
            assert_eq!(out.rows[4].timestamp, t());
        }
    }

    #[test]
    fn out_of_order_and_foreign_entries() {
        let end = t() + Duration::seconds(1);
        let response = vec![
            raw(t() - Duration::minutes(1), 2.0),
            raw(t() - Duration::minutes(30), 9.0),
            raw(t(), 3.0),
        ];
        let out = reconcile("KRW-BTC", end, 2, kst(), FetchOutcome::Candles(response));

        assert_eq!(out.real, 2);
        assert_eq!(out.placeholders, 0);
        assert_eq!(out.ignored, 1);
        assert_eq!(out.rows[0].close, Some(2.0));
        assert_eq!(out.rows[1].close, Some(3.0));
    }

    #[test]
    fn expected_minutes_truncate_in_reporting_zone() {
        let end = t() + Duration::seconds(59);
        let minutes = expected_minutes(end, 2, kst());
        assert_eq!(minutes, vec![t() - Duration::minutes(1), t()]);
    }
}
