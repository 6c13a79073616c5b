// =============================================================================
// Backfill Orchestrator — drives the exchange client over every missing batch
// =============================================================================
//
// One pass per provider at a time:
//   1. take the provider lock (set-if-absent + TTL, tagged with a run token)
//   2. plan missing batches with the Gap Analyzer
//   3. fetch / reconcile / upsert each batch with bounded parallelism,
//      extending the lock TTL before each batch
//   4. mirror the real candles into the shared cache
//   5. release the lock (compare-and-delete), whatever happened in 2–4,
//      including when the pass future is dropped mid-flight
//
// A batch that exhausts its retries writes nothing, so the next pass detects
// the same minutes again. One batch failing never aborts the others.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backfill::gap::{GapAnalyzer, MissingBatch, TrailingSingletonPolicy};
use crate::backfill::reconcile::reconcile;
use crate::cache::{CacheSynchronizer, SharedCache};
use crate::errors::{BackfillError, FetchError};
use crate::exchange::{ExchangeClient, FetchOutcome};
use crate::market_data::CandleStore;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry schedule for a single batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts for transient failures (first try included).
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Wait after an HTTP 429 before the single rate-limit retry.
    pub rate_limit_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base · 2^(retry-1), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// First minute the series should cover.
    pub start: DateTime<Utc>,
    pub max_batch_size: usize,
    pub trailing_singleton: TrailingSingletonPolicy,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub lock_ttl: Duration,
    /// UTC offset the exchange reports candle minutes in.
    pub reporting_offset: FixedOffset,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    /// Every planned batch was written.
    Completed,
    /// At least one batch failed after retries; its minutes remain missing.
    Partial,
    /// Cancellation stopped the pass before every batch ran.
    Cancelled,
    /// Another pass held the provider lock; nothing was done.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub market: String,
    pub run_id: String,
    pub status: PassStatus,
    pub batches_planned: usize,
    pub batches_written: usize,
    pub batches_failed: usize,
    pub batches_cancelled: usize,
    /// Rows written including placeholders.
    pub rows_written: usize,
    pub placeholders_written: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BackfillReport {
    fn new(market: &str, run_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            market: market.to_string(),
            run_id: run_id.to_string(),
            status: PassStatus::Completed,
            batches_planned: 0,
            batches_written: 0,
            batches_failed: 0,
            batches_cancelled: 0,
            rows_written: 0,
            placeholders_written: 0,
            started_at,
            finished_at: started_at,
        }
    }
}

enum BatchResult {
    Written { rows: usize, placeholders: usize },
    Failed,
    Cancelled,
}

enum FetchFailure {
    Exhausted(FetchError),
    Cancelled,
}

/// Key of the per-provider mutual-exclusion flag.
pub fn lock_key(provider: &str) -> String {
    format!("backfill:lock:{provider}")
}

// ---------------------------------------------------------------------------
// Lock guard
// ---------------------------------------------------------------------------

/// Ownership of the provider lock for one pass.
///
/// `release` frees it on the normal path. If the guard is dropped without
/// `release`, because the pass future itself was dropped, the
/// compare-and-delete runs on a spawned task.
struct LockGuard {
    cache: Arc<dyn SharedCache>,
    key: String,
    run_id: String,
    ttl: Duration,
    armed: bool,
}

impl LockGuard {
    /// Push the expiry out by a full TTL. Returns `false` once the lock is
    /// no longer ours.
    async fn refresh(&self) -> bool {
        match self
            .cache
            .extend_if_owner(&self.key, &self.run_id, self.ttl)
            .await
        {
            Ok(owned) => owned,
            Err(e) => {
                warn!(lock = %self.key, error = %e, "failed to extend backfill lock");
                true
            }
        }
    }

    async fn release(mut self) {
        self.armed = false;
        release_lock(self.cache.as_ref(), &self.key, &self.run_id).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (cache, key, run_id) = (
            Arc::clone(&self.cache),
            std::mem::take(&mut self.key),
            std::mem::take(&mut self.run_id),
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(lock = %key, "backfill pass dropped, releasing lock in background");
                handle.spawn(async move {
                    release_lock(cache.as_ref(), &key, &run_id).await;
                });
            }
            Err(_) => warn!(lock = %key, "no runtime to release backfill lock; it will expire"),
        }
    }
}

async fn release_lock(cache: &dyn SharedCache, key: &str, run_id: &str) {
    match cache.release_if_owner(key, run_id).await {
        Ok(true) => debug!(lock = %key, "backfill lock released"),
        Ok(false) => warn!(lock = %key, "backfill lock expired before release"),
        Err(e) => warn!(lock = %key, error = %e, "failed to release backfill lock"),
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct BackfillOrchestrator {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn CandleStore>,
    cache: Arc<dyn SharedCache>,
    mirror: Option<Arc<CacheSynchronizer>>,
    gaps: GapAnalyzer,
    config: BackfillConfig,
}

impl BackfillOrchestrator {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn CandleStore>,
        cache: Arc<dyn SharedCache>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            cache,
            mirror: None,
            gaps: GapAnalyzer::new(config.max_batch_size, config.trailing_singleton),
            config,
        }
    }

    /// Mirror every written real candle through `sync`.
    pub fn with_mirror(mut self, sync: Arc<CacheSynchronizer>) -> Self {
        self.mirror = Some(sync);
        self
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Run one pass for `market` against the current time.
    pub async fn run(
        &self,
        market: &str,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, BackfillError> {
        self.run_at(market, Utc::now(), cancel).await
    }

    /// Run one pass for `market` treating `now` as the end of the timeline.
    pub async fn run_at(
        &self,
        market: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, BackfillError> {
        let run_id = Uuid::new_v4().to_string();
        let key = lock_key(self.exchange.provider());
        let mut report = BackfillReport::new(market, &run_id, Utc::now());

        if !self
            .cache
            .set_if_absent(&key, &run_id, self.config.lock_ttl)
            .await?
        {
            info!(market, lock = %key, "backfill already running, skipping pass");
            report.status = PassStatus::AlreadyRunning;
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let lock = LockGuard {
            cache: Arc::clone(&self.cache),
            key,
            run_id,
            ttl: self.config.lock_ttl,
            armed: true,
        };
        let result = self.run_locked(market, now, cancel, &lock, report).await;
        lock.release().await;

        result
    }

    async fn run_locked(
        &self,
        market: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        lock: &LockGuard,
        mut report: BackfillReport,
    ) -> Result<BackfillReport, BackfillError> {
        let batches = self
            .gaps
            .find_missing(self.store.as_ref(), market, self.config.start, now)
            .await?;
        report.batches_planned = batches.len();

        info!(
            market,
            run_id = %report.run_id,
            batches = batches.len(),
            missing = batches.iter().map(|b| b.count).sum::<usize>(),
            "backfill pass started"
        );

        let results: Vec<BatchResult> = stream::iter(batches)
            .map(|batch| self.process_batch(market, batch, lock, cancel))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                BatchResult::Written { rows, placeholders } => {
                    report.batches_written += 1;
                    report.rows_written += rows;
                    report.placeholders_written += placeholders;
                }
                BatchResult::Failed => report.batches_failed += 1,
                BatchResult::Cancelled => report.batches_cancelled += 1,
            }
        }

        report.status = if report.batches_cancelled > 0 {
            PassStatus::Cancelled
        } else if report.batches_failed > 0 {
            PassStatus::Partial
        } else {
            PassStatus::Completed
        };
        report.finished_at = Utc::now();

        info!(
            market,
            run_id = %report.run_id,
            status = ?report.status,
            written = report.batches_written,
            failed = report.batches_failed,
            cancelled = report.batches_cancelled,
            rows = report.rows_written,
            placeholders = report.placeholders_written,
            "backfill pass finished"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        market: &str,
        batch: MissingBatch,
        lock: &LockGuard,
        cancel: &CancellationToken,
    ) -> BatchResult {
        if cancel.is_cancelled() {
            return BatchResult::Cancelled;
        }
        if !lock.refresh().await {
            warn!(market, lock = %lock.key, "backfill lock lost mid-pass; another pass may overlap");
        }

        let outcome = match self.fetch_with_retry(market, &batch, cancel).await {
            Ok(outcome) => outcome,
            Err(FetchFailure::Cancelled) => return BatchResult::Cancelled,
            Err(FetchFailure::Exhausted(e)) => {
                warn!(
                    market,
                    end = %batch.end,
                    count = batch.count,
                    error = %e,
                    "batch skipped after retries"
                );
                return BatchResult::Failed;
            }
        };

        if let FetchOutcome::Malformed(reason) = &outcome {
            debug!(market, end = %batch.end, reason = %reason, "malformed response, filling placeholders");
        }

        let reconciled = reconcile(
            market,
            batch.end,
            batch.count,
            self.config.reporting_offset,
            outcome,
        );
        if reconciled.ignored > 0 {
            debug!(market, ignored = reconciled.ignored, "response entries outside the batch ignored");
        }

        let rows = reconciled.rows;
        let summary = match self.store.bulk_upsert(rows.clone()).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(market, end = %batch.end, error = %e, "batch write failed");
                return BatchResult::Failed;
            }
        };
        if summary.updated > 0 {
            warn!(
                market,
                end = %batch.end,
                updated = summary.updated,
                "backfill overwrote rows that were expected to be missing"
            );
        }

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.mirror(&rows).await {
                warn!(market, error = %e, "cache mirror failed; reconciliation will republish");
            }
        }

        debug!(
            market,
            end = %batch.end,
            real = reconciled.real,
            placeholders = reconciled.placeholders,
            "batch written"
        );
        BatchResult::Written {
            rows: summary.total(),
            placeholders: reconciled.placeholders,
        }
    }

    async fn fetch_with_retry(
        &self,
        market: &str,
        batch: &MissingBatch,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchFailure> {
        let retry = self.config.retry;
        let mut transient_failures = 0u32;
        let mut rate_limited = false;

        loop {
            let err = match self
                .exchange
                .fetch_recent(market, batch.end, batch.count)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            let delay = match &err {
                FetchError::RateLimited { retry_after } if !rate_limited => {
                    rate_limited = true;
                    let wait = retry_after.map_or(retry.rate_limit_backoff, |r| {
                        r.max(retry.rate_limit_backoff)
                    });
                    warn!(market, wait_secs = wait.as_secs(), "rate limited, backing off");
                    Some(wait)
                }
                e if e.is_transient() && transient_failures + 1 < retry.max_attempts => {
                    transient_failures += 1;
                    let wait = retry.backoff(transient_failures);
                    debug!(
                        market,
                        attempt = transient_failures,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, retrying"
                    );
                    Some(wait)
                }
                _ => None,
            };
            let Some(delay) = delay else {
                return Err(FetchFailure::Exhausted(err));
            };

            if !pause(delay, cancel).await {
                return Err(FetchFailure::Cancelled);
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancel.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::reconcile::expected_minutes;
    use crate::cache::MemoryCache;
    use crate::exchange::RawCandle;
    use crate::market_data::MemoryCandleStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Full,
        Empty,
        RateLimited,
        ServerError,
    }

    /// Exchange double: answers from a script, then with full data.
    #[derive(Default)]
    struct ScriptedExchange {
        script: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(DateTime<Utc>, usize)>>,
    }

    impl ScriptedExchange {
        fn with_script(steps: &[Step]) -> Self {
            Self {
                script: Mutex::new(steps.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn fetch_recent(
            &self,
            _market: &str,
            to: DateTime<Utc>,
            count: usize,
        ) -> Result<FetchOutcome, FetchError> {
            self.calls.lock().push((to, count));
            let step = self.script.lock().pop_front().unwrap_or(Step::Full);
            match step {
                Step::Full => Ok(FetchOutcome::Candles(
                    expected_minutes(to, count, kst())
                        .into_iter()
                        .rev()
                        .map(|ts| RawCandle {
                            timestamp: ts,
                            open: 100.0,
                            high: 101.0,
                            low: 99.0,
                            close: 100.5,
                            acc_trade_value: 1000.0,
                            acc_trade_volume: 10.0,
                        })
                        .collect(),
                )),
                Step::Empty => Ok(FetchOutcome::Empty),
                Step::RateLimited => Err(FetchError::RateLimited { retry_after: None }),
                Step::ServerError => Err(FetchError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                }),
            }
        }
    }

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 20, 0, 0, 0).unwrap()
    }

    fn config(max_batch_size: usize, max_concurrency: usize) -> BackfillConfig {
        BackfillConfig {
            start: t0(),
            max_batch_size,
            trailing_singleton: TrailingSingletonPolicy::Include,
            max_concurrency,
            retry: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(600),
            reporting_offset: kst(),
        }
    }

    struct Harness {
        exchange: Arc<ScriptedExchange>,
        store: Arc<MemoryCandleStore>,
        cache: Arc<MemoryCache>,
        orchestrator: BackfillOrchestrator,
    }

    fn harness(steps: &[Step], cfg: BackfillConfig) -> Harness {
        let exchange = Arc::new(ScriptedExchange::with_script(steps));
        let store = Arc::new(MemoryCandleStore::new());
        let cache = Arc::new(MemoryCache::new());
        let sync = Arc::new(CacheSynchronizer::new(
            cache.clone(),
            "scripted",
            "1m",
            ChronoDuration::days(365),
        ));
        let orchestrator =
            BackfillOrchestrator::new(exchange.clone(), store.clone(), cache.clone(), cfg)
                .with_mirror(sync);
        Harness {
            exchange,
            store,
            cache,
            orchestrator,
        }
    }

    fn now() -> DateTime<Utc> {
        t0() + ChronoDuration::minutes(9) + ChronoDuration::seconds(30)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            rate_limit_backoff: Duration::from_secs(60),
        };
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(4), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fills_timeline_then_second_pass_is_a_no_op() {
        let h = harness(&[], config(4, 3));
        let cancel = CancellationToken::new();

        let first = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(first.status, PassStatus::Completed);
        assert_eq!(first.batches_planned, 3); // 10 minutes in batches of 4
        assert_eq!(first.rows_written, 10);
        assert_eq!(first.placeholders_written, 0);
        assert_eq!(h.store.count("KRW-BTC"), 10);

        let calls = h.exchange.call_count();
        let second = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(second.status, PassStatus::Completed);
        assert_eq!(second.batches_planned, 0);
        assert_eq!(second.rows_written, 0);
        assert_eq!(h.exchange.call_count(), calls);
    }

    #[tokio::test]
    async fn empty_response_records_placeholders_and_is_not_refetched() {
        let h = harness(&[Step::Empty], config(200, 1));
        let cancel = CancellationToken::new();

        let report = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(report.rows_written, 10);
        assert_eq!(report.placeholders_written, 10);
        // Placeholders are not mirrored.
        assert_eq!(h.cache.sorted_len("scripted:KRW-BTC:1m"), 0);

        let again = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(again.batches_planned, 0);
    }

    #[tokio::test]
    async fn real_rows_are_mirrored_to_cache() {
        let h = harness(&[], config(200, 1));
        h.orchestrator
            .run_at("KRW-BTC", now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.cache.sorted_len("scripted:KRW-BTC:1m"), 10);
    }

    #[tokio::test]
    async fn held_lock_short_circuits_the_pass() {
        let h = harness(&[], config(200, 1));
        let key = lock_key("scripted");
        h.cache
            .set_if_absent(&key, "someone-else", Duration::from_secs(600))
            .await
            .unwrap();

        let report = h
            .orchestrator
            .run_at("KRW-BTC", now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, PassStatus::AlreadyRunning);
        assert_eq!(h.exchange.call_count(), 0);
        assert_eq!(h.cache.flag(&key).as_deref(), Some("someone-else"));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_released_after_the_pass() {
        let h = harness(&[Step::ServerError; 3], config(200, 1));
        let report = h
            .orchestrator
            .run_at("KRW-BTC", now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, PassStatus::Partial);
        assert!(h.cache.flag(&lock_key("scripted")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_pass_still_releases_lock() {
        // Always-429 keeps the pass parked in the long backoff.
        let h = harness(&[Step::RateLimited], config(200, 1));
        let cancel = CancellationToken::new();

        let timed_out = tokio::time::timeout(
            Duration::from_secs(5),
            h.orchestrator.run_at("KRW-BTC", now(), &cancel),
        )
        .await;
        assert!(timed_out.is_err());

        let key = lock_key("scripted");
        for _ in 0..10 {
            if h.cache.flag(&key).is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(h.cache.flag(&key).is_none());

        let next = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(next.status, PassStatus::Completed);
        assert_eq!(h.store.count("KRW-BTC"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_extended_between_batches() {
        let mut cfg = config(5, 1);
        cfg.lock_ttl = Duration::from_secs(90);
        // Each batch sits out one 60s rate-limit backoff, so the pass
        // outlives a single TTL.
        let h = harness(
            &[Step::RateLimited, Step::Full, Step::RateLimited, Step::Full],
            cfg,
        );
        let cache = h.cache.clone();
        let key = lock_key("scripted");

        let pass = tokio::spawn(async move {
            h.orchestrator
                .run_at("KRW-BTC", now(), &CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(cache.flag(&key).is_some());

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.status, PassStatus::Completed);
        assert_eq!(report.rows_written, 10);
        assert!(cache.flag(&key).is_none());
    }

    #[tokio::test]
    async fn defer_never_stores_the_forming_minute() {
        let mut cfg = config(200, 1);
        cfg.trailing_singleton = TrailingSingletonPolicy::Defer;
        let h = harness(&[Step::Empty], cfg);
        let now = t0() + ChronoDuration::minutes(5) + ChronoDuration::seconds(20);

        let report = h
            .orchestrator
            .run_at("KRW-BTC", now, &CancellationToken::new())
            .await
            .unwrap();
        // 00:00..=00:04 become placeholders; 00:05 is still forming.
        assert_eq!(report.placeholders_written, 5);
        assert_eq!(h.store.count("KRW-BTC"), 5);
        let newest = h
            .store
            .exists_minutes("KRW-BTC", t0(), now)
            .await
            .unwrap()
            .into_iter()
            .max();
        assert_eq!(newest, Some(t0() + ChronoDuration::minutes(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_the_long_backoff_then_retries_once() {
        let h = harness(&[Step::RateLimited], config(200, 1));
        let started = tokio::time::Instant::now();

        let report = h
            .orchestrator
            .run_at("KRW-BTC", now(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(report.status, PassStatus::Completed);
        assert_eq!(report.rows_written, 10);
        assert_eq!(h.exchange.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_rate_limit_fails_the_batch_and_leaves_the_gap() {
        let h = harness(&[Step::RateLimited, Step::RateLimited], config(200, 1));
        let cancel = CancellationToken::new();

        let report = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(report.status, PassStatus::Partial);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(h.store.count("KRW-BTC"), 0);

        // Next pass re-detects and fills it.
        let retry = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(retry.batches_planned, 1);
        assert_eq!(h.store.count("KRW-BTC"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_max_attempts() {
        let h = harness(&[Step::ServerError, Step::ServerError], config(200, 1));
        let report = h
            .orchestrator
            .run_at("KRW-BTC", now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, PassStatus::Completed);
        assert_eq!(h.exchange.call_count(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_writes_nothing() {
        let h = harness(&[], config(4, 2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(report.status, PassStatus::Cancelled);
        assert_eq!(report.batches_cancelled, 3);
        assert_eq!(h.exchange.call_count(), 0);
        assert_eq!(h.store.count("KRW-BTC"), 0);
        assert!(h.cache.flag(&lock_key("scripted")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_rate_limit_backoff() {
        let h = harness(&[Step::RateLimited], config(200, 1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let report = h.orchestrator.run_at("KRW-BTC", now(), &cancel).await.unwrap();
        assert_eq!(report.status, PassStatus::Cancelled);
        assert_eq!(h.exchange.call_count(), 1);
        assert_eq!(h.store.count("KRW-BTC"), 0);
    }
}
