// =============================================================================
// Remaining-Req tracker — keeps the Upbit client under its request budget
// =============================================================================
//
// Upbit reports the remaining budget of the request group on every response:
//
//   Remaining-Req: group=candles; min=599; sec=9
//
// `sec` is the number of calls still allowed in the current one-second
// window. When it reaches zero the client waits for the window to roll over
// before issuing the next request, instead of provoking a 429.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Name of the response header carrying the budget.
pub const REMAINING_REQ_HEADER: &str = "Remaining-Req";

/// Pause applied when the per-second budget is exhausted.
const SECOND_WINDOW: Duration = Duration::from_millis(1_000);

/// Parsed value of one `Remaining-Req` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingReq {
    pub group: String,
    pub min: Option<u32>,
    pub sec: Option<u32>,
}

impl RemainingReq {
    /// Parse `group=candles; min=599; sec=9`. Unknown keys are ignored; a
    /// value without a `group` is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut group = None;
        let mut min = None;
        let mut sec = None;

        for part in raw.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "group" => group = Some(value.trim().to_string()),
                "min" => min = value.trim().parse().ok(),
                "sec" => sec = value.trim().parse().ok(),
                _ => {}
            }
        }

        Some(Self {
            group: group?,
            min,
            sec,
        })
    }
}

/// Lock-free view of the last budget the exchange reported.
///
/// `-1` in a counter means "not reported yet".
pub struct RemainingReqTracker {
    sec: AtomicI64,
    min: AtomicI64,
}

impl RemainingReqTracker {
    pub fn new() -> Self {
        Self {
            sec: AtomicI64::new(-1),
            min: AtomicI64::new(-1),
        }
    }

    /// Update counters from a response's headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(parsed) = headers
            .get(REMAINING_REQ_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(RemainingReq::parse)
        else {
            return;
        };
        self.record(&parsed);
    }

    pub fn record(&self, parsed: &RemainingReq) {
        if let Some(sec) = parsed.sec {
            self.sec.store(i64::from(sec), Ordering::Relaxed);
            if sec == 0 {
                warn!(group = %parsed.group, "per-second request budget exhausted");
            }
        }
        if let Some(min) = parsed.min {
            self.min.store(i64::from(min), Ordering::Relaxed);
        }
        debug!(group = %parsed.group, sec = ?parsed.sec, min = ?parsed.min, "remaining-req updated");
    }

    /// How long to wait before the next request, if at all.
    pub fn throttle_delay(&self) -> Option<Duration> {
        (self.sec.load(Ordering::Relaxed) == 0).then_some(SECOND_WINDOW)
    }

    /// Forget the exhausted state once the caller has waited it out.
    pub fn reset_second_window(&self) {
        let _ = self
            .sec
            .compare_exchange(0, -1, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Last reported per-second budget, `None` before the first response.
    pub fn remaining_sec(&self) -> Option<u32> {
        u32::try_from(self.sec.load(Ordering::Relaxed)).ok()
    }

    pub fn remaining_min(&self) -> Option<u32> {
        u32::try_from(self.min.load(Ordering::Relaxed)).ok()
    }
}

impl Default for RemainingReqTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RemainingReqTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemainingReqTracker")
            .field("sec", &self.remaining_sec())
            .field("min", &self.remaining_min())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn parses_full_header() {
        let r = RemainingReq::parse("group=candles; min=599; sec=9").unwrap();
        assert_eq!(r.group, "candles");
        assert_eq!(r.min, Some(599));
        assert_eq!(r.sec, Some(9));
    }

    #[test]
    fn parses_without_min() {
        let r = RemainingReq::parse("group=candles; sec=0").unwrap();
        assert_eq!(r.min, None);
        assert_eq!(r.sec, Some(0));
    }

    #[test]
    fn rejects_header_without_group() {
        assert!(RemainingReq::parse("min=1; sec=2").is_none());
        assert!(RemainingReq::parse("").is_none());
    }

    #[test]
    fn throttles_only_when_second_budget_is_zero() {
        let tracker = RemainingReqTracker::new();
        assert!(tracker.throttle_delay().is_none());

        let mut headers = HeaderMap::new();
        headers.insert(REMAINING_REQ_HEADER, HeaderValue::from_static("group=candles; min=10; sec=3"));
        tracker.update_from_headers(&headers);
        assert!(tracker.throttle_delay().is_none());
        assert_eq!(tracker.remaining_sec(), Some(3));

        headers.insert(REMAINING_REQ_HEADER, HeaderValue::from_static("group=candles; min=9; sec=0"));
        tracker.update_from_headers(&headers);
        assert_eq!(tracker.throttle_delay(), Some(SECOND_WINDOW));

        tracker.reset_second_window();
        assert!(tracker.throttle_delay().is_none());
        assert_eq!(tracker.remaining_min(), Some(9));
    }

    #[test]
    fn debug_output_shows_reported_budget() {
        let tracker = RemainingReqTracker::new();
        let blank = format!("{tracker:?}");
        assert!(blank.starts_with("RemainingReqTracker"));
        assert!(blank.contains("None"));

        tracker.record(&RemainingReq::parse("group=candles; min=42; sec=7").unwrap());
        let seen = format!("{tracker:?}");
        assert!(seen.contains("Some(7)"));
        assert!(seen.contains("Some(42)"));
    }
}
