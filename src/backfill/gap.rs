// =============================================================================
// Gap Analyzer — which minutes should exist but don't
// =============================================================================
//
// Expected timeline: every minute from `start` (rounded up) to `now`
// (truncated), inclusive. Under the `Defer` policy the truncated `now`
// minute is still forming and is left out. Anything in that timeline without a row, real or
// placeholder, is missing. Missing minutes are grouped into runs of
// consecutive minutes, capped at `max_batch_size`, and each run becomes one
// exchange request.
// =============================================================================

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::StoreError;
use crate::market_data::{ceil_to_minute, one_minute, truncate_to_minute, CandleStore};

/// Whether the minute containing `now` belongs to the timeline.
///
/// That minute is still being formed by the exchange, so `Defer` leaves it
/// for the next pass no matter how long the missing run ending there is.
/// `Include` plans it like any other minute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingSingletonPolicy {
    Include,
    #[default]
    Defer,
}

/// A contiguous run of missing minutes, expressed the way the exchange wants
/// it: an exclusive `end` bound and a `count` of minutes before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingBatch {
    /// Most recent missing minute + 1 second.
    pub end: DateTime<Utc>,
    pub count: usize,
}

impl MissingBatch {
    /// Most recent minute covered.
    pub fn last_minute(&self) -> DateTime<Utc> {
        truncate_to_minute(self.end)
    }

    /// Oldest minute covered.
    pub fn first_minute(&self) -> DateTime<Utc> {
        self.last_minute() - Duration::minutes(self.count.saturating_sub(1) as i64)
    }

    /// Every minute covered, ascending.
    pub fn minutes(&self) -> impl Iterator<Item = DateTime<Utc>> {
        let first = self.first_minute();
        (0..self.count as i64).map(move |i| first + Duration::minutes(i))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GapAnalyzer {
    max_batch_size: usize,
    trailing_singleton: TrailingSingletonPolicy,
}

impl GapAnalyzer {
    pub fn new(max_batch_size: usize, trailing_singleton: TrailingSingletonPolicy) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            trailing_singleton,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Query `store` for existing rows and plan the missing batches.
    pub async fn find_missing(
        &self,
        store: &dyn CandleStore,
        market: &str,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<MissingBatch>, StoreError> {
        let (first, last) = (ceil_to_minute(start), truncate_to_minute(now));
        if first > last {
            return Ok(Vec::new());
        }
        let existing = store.exists_minutes(market, first, last).await?;
        let batches = self.plan(start, now, &existing);
        debug!(
            market,
            existing = existing.len(),
            batches = batches.len(),
            "gap analysis complete"
        );
        Ok(batches)
    }

    /// Pure planning step: timeline minus `existing`, grouped into batches.
    pub fn plan(
        &self,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
        existing: &BTreeSet<DateTime<Utc>>,
    ) -> Vec<MissingBatch> {
        let first = ceil_to_minute(start);
        let last = match self.trailing_singleton {
            TrailingSingletonPolicy::Include => truncate_to_minute(now),
            TrailingSingletonPolicy::Defer => truncate_to_minute(now) - one_minute(),
        };
        let mut batches = Vec::new();
        if first > last {
            return batches;
        }

        // (last minute of the run, run length)
        let mut run: Option<(DateTime<Utc>, usize)> = None;
        let mut ts = first;
        while ts <= last {
            if !existing.contains(&ts) {
                run = match run {
                    Some((prev, len)) if ts - prev == one_minute() && len < self.max_batch_size => {
                        Some((ts, len + 1))
                    }
                    Some(closed) => {
                        batches.push(Self::emit(closed));
                        Some((ts, 1))
                    }
                    None => Some((ts, 1)),
                };
            }
            ts += one_minute();
        }

        if let Some(closed) = run {
            batches.push(Self::emit(closed));
        }
        batches
    }

    fn emit((last, count): (DateTime<Utc>, usize)) -> MissingBatch {
        MissingBatch {
            end: last + Duration::seconds(1),
            count,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
