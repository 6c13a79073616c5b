// =============================================================================
// Triggers — the units of work behind the API, the CLI and the schedules
// =============================================================================
//
// Each trigger is idempotent: running it twice in a row leaves the same
// stored state as running it once. Outcomes and failures are recorded on the
// shared `AppState` so the health endpoint can report them.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::app_state::{AppState, IndicatorRunSummary};
use crate::backfill::BackfillReport;
use crate::cache::CacheReconcileReport;
use crate::indicators::AnalysisReport;
use crate::market_data::UpsertSummary;

/// Result of one indicator batch.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorBatchReport {
    pub analysis: AnalysisReport,
    pub persisted: UpsertSummary,
}

/// `QUOTE-BASE` with both halves alphanumeric, e.g. `KRW-BTC`.
pub fn is_valid_market(market: &str) -> bool {
    let mut parts = market.split('-');
    let (Some(quote), Some(base), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    [quote, base]
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn ensure_market(market: &str) -> Result<()> {
    if !is_valid_market(market) {
        bail!("invalid market code '{market}'");
    }
    Ok(())
}

/// Run one backfill pass for `market`.
pub async fn trigger_backfill(state: &AppState, market: &str) -> Result<BackfillReport> {
    ensure_market(market)?;

    match state.orchestrator.run(market, &state.shutdown).await {
        Ok(report) => {
            state.record_backfill(report.clone());
            Ok(report)
        }
        Err(e) => {
            state.push_error("backfill", market, e.to_string());
            Err(e).with_context(|| format!("backfill pass for {market} failed"))
        }
    }
}

/// Compute `selection` (whole catalogue when `None`) for `market` and upsert
/// the resulting rows.
pub async fn trigger_indicator_batch(
    state: &AppState,
    market: &str,
    selection: Option<&[String]>,
    candle_count: Option<usize>,
) -> Result<IndicatorBatchReport> {
    ensure_market(market)?;
    let candle_count = candle_count.unwrap_or(state.config.indicators.candle_count);

    let result = async {
        let analysis = state
            .analyzer
            .analyze(market, selection, candle_count)
            .await
            .context("failed to load indicator window")?;
        let records = analysis
            .records()
            .context("failed to serialise indicator rows")?;
        let persisted = state
            .indicator_store
            .upsert_indicators(records)
            .await
            .context("failed to persist indicator rows")?;
        anyhow::Ok(IndicatorBatchReport { analysis, persisted })
    }
    .await;

    match result {
        Ok(report) => {
            info!(
                market,
                computed = report.analysis.results.len(),
                inserted = report.persisted.inserted,
                updated = report.persisted.updated,
                "indicator batch persisted"
            );
            state.record_indicators(
                market,
                IndicatorRunSummary {
                    computed: report.analysis.results.len(),
                    failed: report.analysis.failures.len(),
                    persisted: report.persisted,
                    at: Utc::now(),
                },
            );
            Ok(report)
        }
        Err(e) => {
            state.push_error("indicators", market, format!("{e:#}"));
            Err(e.context(format!("indicator batch for {market} failed")))
        }
    }
}

/// Republish candles the cache is missing over the configured trailing
/// window, trimming entries past retention.
pub async fn trigger_cache_reconcile(
    state: &AppState,
    market: &str,
) -> Result<CacheReconcileReport> {
    ensure_market(market)?;
    let window = Duration::minutes(state.config.cache.reconcile_window_minutes);

    match state
        .synchronizer
        .reconcile(state.store.as_ref(), market, window, Utc::now())
        .await
    {
        Ok(report) => {
            state.record_cache_reconcile(report.clone());
            Ok(report)
        }
        Err(e) => {
            warn!(market, error = %e, "cache reconciliation failed");
            state.push_error("cache_reconcile", market, e.to_string());
            Err(e).with_context(|| format!("cache reconciliation for {market} failed"))
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::tests::{memory_state, recent_config};
    use crate::backfill::PassStatus;
    use crate::market_data::{Candle, CandleStore, IndicatorStore};

    #[test]
    fn market_codes_are_validated() {
        assert!(is_valid_market("KRW-BTC"));
        assert!(is_valid_market("USDT-1INCH"));
        assert!(!is_valid_market("KRWBTC"));
        assert!(!is_valid_market("KRW-"));
        assert!(!is_valid_market("KRW-BTC-X"));
        assert!(!is_valid_market("KRW-B/C"));
    }

    #[tokio::test]
    async fn backfill_fills_recent_gap_with_placeholders_then_is_a_no_op() {
        let (state, store) = memory_state(recent_config(10));

        let first = trigger_backfill(&state, "KRW-BTC").await.unwrap();
        assert_eq!(first.status, PassStatus::Completed);
        assert!(first.rows_written > 0);
        assert_eq!(first.rows_written, first.placeholders_written);
        let stored = store.count("KRW-BTC");

        let second = trigger_backfill(&state, "KRW-BTC").await.unwrap();
        assert!(second.rows_written <= 1);
        assert!(store.count("KRW-BTC") <= stored + 1);
        assert!(state.last_backfill.read().contains_key("KRW-BTC"));
    }

    #[tokio::test]
    async fn invalid_market_is_rejected_before_any_work() {
        let (state, _) = memory_state(recent_config(10));
        assert!(trigger_backfill(&state, "nonsense").await.is_err());
        assert!(state.last_backfill.read().is_empty());
    }

    #[tokio::test]
    async fn indicator_batch_persists_rows() {
        let (state, store) = memory_state(recent_config(10));
        let start = crate::market_data::truncate_to_minute(Utc::now()) - Duration::minutes(60);
        let rows: Vec<Candle> = (0..60)
            .map(|i| {
                let close = 100.0 + (i % 7) as f64;
                Candle {
                    market: "KRW-ETH".into(),
                    timestamp: start + Duration::minutes(i),
                    open: Some(close),
                    high: Some(close + 1.0),
                    low: Some(close - 1.0),
                    close: Some(close),
                    acc_trade_value: Some(close * 3.0),
                    acc_trade_volume: Some(3.0),
                }
            })
            .collect();
        store.bulk_upsert(rows).await.unwrap();

        let selection = vec!["rsi".to_string(), "ema_short".to_string()];
        let report = trigger_indicator_batch(&state, "KRW-ETH", Some(selection.as_slice()), Some(5))
            .await
            .unwrap();

        assert_eq!(report.analysis.results.len(), 2);
        assert_eq!(report.persisted.inserted, 10);

        let params = report.analysis.results["rsi"].params.clone();
        let series = store.indicator_series("KRW-ETH", "rsi", &params).await.unwrap();
        assert_eq!(series.len(), 5);

        let again = trigger_indicator_batch(&state, "KRW-ETH", Some(selection.as_slice()), Some(5))
            .await
            .unwrap();
        assert_eq!(again.persisted.inserted, 0);
        assert_eq!(again.persisted.updated, 10);
    }

    #[tokio::test]
    async fn cache_reconcile_republishes_stored_candles() {
        let (state, store) = memory_state(recent_config(10));
        let ts = crate::market_data::truncate_to_minute(Utc::now()) - Duration::minutes(3);
        store
            .bulk_upsert(vec![Candle {
                market: "KRW-BTC".into(),
                timestamp: ts,
                open: Some(1.0),
                high: Some(1.0),
                low: Some(1.0),
                close: Some(1.0),
                acc_trade_value: Some(1.0),
                acc_trade_volume: Some(1.0),
            }])
            .await
            .unwrap();

        let report = trigger_cache_reconcile(&state, "KRW-BTC").await.unwrap();
        assert_eq!(report.republished, 1);

        let again = trigger_cache_reconcile(&state, "KRW-BTC").await.unwrap();
        assert_eq!(again.republished, 0);
    }
}
