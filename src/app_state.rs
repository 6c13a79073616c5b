// =============================================================================
// Central Application State — candle-forge
// =============================================================================
//
// Ties the long-lived components together: the candle store, the exchange
// client, the shared cache and the three engines built on top of them
// (backfill orchestrator, cache synchronizer, technical analyzer). The HTTP
// trigger API, the CLI subcommands and the periodic loops all share one
// `Arc<AppState>`.
//
// Thread safety:
//   - Atomic counter for version tracking.
//   - parking_lot::RwLock for the mutable status collections.
//   - Arc wrappers for components that manage their own interior mutability.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backfill::{BackfillOrchestrator, BackfillReport};
use crate::cache::{CacheReconcileReport, CacheSynchronizer, SharedCache};
use crate::exchange::ExchangeClient;
use crate::indicators::TechnicalAnalyzer;
use crate::market_data::{CandleStore, IndicatorStore, UpsertSummary};
use crate::runtime_config::RuntimeConfig;

// =============================================================================
// Status records
// =============================================================================

/// A recorded failure for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Which trigger failed (`backfill`, `indicators`, `cache_reconcile`).
    pub task: String,
    pub market: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Last indicator batch per market.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorRunSummary {
    pub computed: usize,
    pub failed: usize,
    pub persisted: UpsertSummary,
    pub at: DateTime<Utc>,
}

/// Payload of `GET /api/v1/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub provider: String,
    pub markets: Vec<String>,
    pub state_version: u64,
    pub uptime_secs: u64,
    pub server_time: DateTime<Utc>,
    pub last_backfill: BTreeMap<String, BackfillReport>,
    pub last_indicators: BTreeMap<String, IndicatorRunSummary>,
    pub last_cache_reconcile: BTreeMap<String, CacheReconcileReport>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

pub struct AppState {
    /// Monotonically increasing; bumped whenever a trigger finishes.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: RuntimeConfig,

    // ── Components ──────────────────────────────────────────────────────
    pub store: Arc<dyn CandleStore>,
    pub indicator_store: Arc<dyn IndicatorStore>,
    pub cache: Arc<dyn SharedCache>,
    pub orchestrator: Arc<BackfillOrchestrator>,
    pub synchronizer: Arc<CacheSynchronizer>,
    pub analyzer: Arc<TechnicalAnalyzer>,

    /// Cancelled on shutdown; every backfill pass observes it.
    pub shutdown: CancellationToken,

    // ── Operational status ──────────────────────────────────────────────
    pub last_backfill: RwLock<BTreeMap<String, BackfillReport>>,
    pub last_indicators: RwLock<BTreeMap<String, IndicatorRunSummary>>,
    pub last_cache_reconcile: RwLock<BTreeMap<String, CacheReconcileReport>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    provider: String,
    start_time: std::time::Instant,
}

impl AppState {
    /// Wire the engines over already-constructed components.
    ///
    /// `store` backs both candle and indicator persistence. Fails when the
    /// configuration does not validate.
    pub fn new<S>(
        config: RuntimeConfig,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<S>,
        cache: Arc<dyn SharedCache>,
    ) -> Result<Self>
    where
        S: CandleStore + IndicatorStore + 'static,
    {
        config.validate().context("invalid runtime config")?;

        let provider = exchange.provider().to_string();
        let candle_store: Arc<dyn CandleStore> = store.clone();
        let indicator_store: Arc<dyn IndicatorStore> = store;

        let synchronizer = Arc::new(CacheSynchronizer::new(
            cache.clone(),
            provider.clone(),
            config.cache.timeframe.clone(),
            Duration::days(config.cache.retention_days),
        ));

        let orchestrator = BackfillOrchestrator::new(
            exchange,
            candle_store.clone(),
            cache.clone(),
            config.backfill_config()?,
        )
        .with_mirror(synchronizer.clone());

        let analyzer = TechnicalAnalyzer::new(
            candle_store.clone(),
            config.indicators.catalogue.clone(),
            config.indicators.max_period,
        );

        Ok(Self {
            state_version: AtomicU64::new(1),
            config,
            store: candle_store,
            indicator_store,
            cache,
            orchestrator: Arc::new(orchestrator),
            synchronizer,
            analyzer: Arc::new(analyzer),
            shutdown: CancellationToken::new(),
            last_backfill: RwLock::new(BTreeMap::new()),
            last_indicators: RwLock::new(BTreeMap::new()),
            last_cache_reconcile: RwLock::new(BTreeMap::new()),
            recent_errors: RwLock::new(Vec::new()),
            provider,
            start_time: std::time::Instant::now(),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Status recording ────────────────────────────────────────────────

    pub fn record_backfill(&self, report: BackfillReport) {
        self.last_backfill.write().insert(report.market.clone(), report);
        self.increment_version();
    }

    pub fn record_indicators(&self, market: &str, summary: IndicatorRunSummary) {
        self.last_indicators.write().insert(market.to_string(), summary);
        self.increment_version();
    }

    pub fn record_cache_reconcile(&self, report: CacheReconcileReport) {
        self.last_cache_reconcile
            .write()
            .insert(report.market.clone(), report);
        self.increment_version();
    }

    /// Record a failed trigger. The buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted first.
    pub fn push_error(&self, task: &str, market: &str, message: String) {
        let record = ErrorRecord {
            task: task.to_string(),
            market: market.to_string(),
            message,
            at: Utc::now(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    pub fn build_health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            provider: self.provider.clone(),
            markets: self.config.markets.clone(),
            state_version: self.current_state_version(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now(),
            last_backfill: self.last_backfill.read().clone(),
            last_indicators: self.last_indicators.read().clone(),
            last_cache_reconcile: self.last_cache_reconcile.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}
