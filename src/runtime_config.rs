// =============================================================================
// Runtime Configuration — candle-forge settings with atomic save
// =============================================================================
//
// Every tunable lives here: which markets to track, how to reach the
// exchange, how aggressively to backfill, where the store and cache live and
// which indicators to compute.
//
// Persistence uses an atomic tmp + rename pattern. All fields carry
// `#[serde(default)]` so an older or partial config file always loads.
// Selected values can be overridden from the environment (see
// `apply_overrides`).
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backfill::{BackfillConfig, RetryPolicy, TrailingSingletonPolicy};
use crate::exchange::upbit::MAX_COUNT;
use crate::indicators::{default_catalogue, NamedIndicator};
use crate::market_data::ceil_to_minute;

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "candle_forge.json";

/// Config file location: `CANDLE_FORGE_CONFIG` or [`DEFAULT_CONFIG_PATH`].
pub fn config_path() -> PathBuf {
    std::env::var("CANDLE_FORGE_CONFIG")
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_markets() -> Vec<String> {
    vec![
        "KRW-BTC".to_string(),
        "KRW-ETH".to_string(),
        "KRW-DOGE".to_string(),
    ]
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_provider() -> String {
    "upbit".to_string()
}

fn default_base_url() -> String {
    "https://api.upbit.com".to_string()
}

fn default_reporting_offset_minutes() -> i32 {
    9 * 60
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_start_date() -> String {
    "2021-01-01T00:00:00+09:00".to_string()
}

fn default_max_batch_size() -> usize {
    MAX_COUNT
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_rate_limit_backoff_secs() -> u64 {
    60
}

fn default_lock_ttl_secs() -> u64 {
    30 * 60
}

fn default_backfill_interval_secs() -> u64 {
    60
}

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_retention_days() -> i64 {
    365
}

fn default_reconcile_window_minutes() -> i64 {
    24 * 60
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_candle_count() -> usize {
    100
}

fn default_max_period() -> usize {
    500
}

fn default_indicator_interval_secs() -> u64 {
    60
}

fn default_db_path() -> String {
    "candle_forge.db".to_string()
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSettings {
    /// Provider name used in lock and cache keys.
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// UTC offset the exchange reports candle minutes in (KST = +540).
    #[serde(default = "default_reporting_offset_minutes")]
    pub reporting_offset_minutes: i32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            reporting_offset_minutes: default_reporting_offset_minutes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ExchangeSettings {
    pub fn reporting_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.reporting_offset_minutes * 60)
            .with_context(|| format!("invalid reporting offset {} min", self.reporting_offset_minutes))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillSettings {
    /// First minute the series should cover (RFC 3339).
    #[serde(default = "default_start_date")]
    pub start_date: String,

    /// Minutes per exchange request (the exchange caps this at 200).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default)]
    pub trailing_singleton: TrailingSingletonPolicy,

    /// Batches fetched in parallel within one pass.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Wait after HTTP 429 before the single retry.
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,

    /// Expiry of the per-provider pass lock. Renewed to the full TTL at the
    /// start of every batch, so it only has to outlast one batch.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    #[serde(default = "default_backfill_interval_secs")]
    pub interval_secs: u64,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            start_date: default_start_date(),
            max_batch_size: default_max_batch_size(),
            trailing_singleton: TrailingSingletonPolicy::default(),
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            interval_secs: default_backfill_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Redis URL; the in-process cache is used when absent.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Trailing window compared during reconciliation.
    #[serde(default = "default_reconcile_window_minutes")]
    pub reconcile_window_minutes: i64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeframe: default_timeframe(),
            retention_days: default_retention_days(),
            reconcile_window_minutes: default_reconcile_window_minutes(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSettings {
    /// Rows returned per indicator.
    #[serde(default = "default_candle_count")]
    pub candle_count: usize,

    /// Candles loaded into the shared window.
    #[serde(default = "default_max_period")]
    pub max_period: usize,

    #[serde(default = "default_indicator_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_catalogue")]
    pub catalogue: Vec<NamedIndicator>,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            candle_count: default_candle_count(),
            max_period: default_max_period(),
            interval_secs: default_indicator_interval_secs(),
            catalogue: default_catalogue(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite database file (`:memory:` for a throwaway store).
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_markets")]
    pub markets: Vec<String>,

    /// Address the trigger API listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub exchange: ExchangeSettings,

    #[serde(default)]
    pub backfill: BackfillSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub indicators: IndicatorSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            markets: default_markets(),
            bind_addr: default_bind_addr(),
            exchange: ExchangeSettings::default(),
            backfill: BackfillSettings::default(),
            cache: CacheSettings::default(),
            indicators: IndicatorSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            markets = ?config.markets,
            provider = %config.exchange.provider,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// [`load`](Self::load), falling back to defaults with a warning.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "runtime config unavailable, using defaults");
                Self::default()
            }
        }
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `CANDLE_FORGE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup:
    ///
    /// - `CANDLE_FORGE_MARKETS`   comma-separated market list
    /// - `CANDLE_FORGE_REDIS_URL` shared cache URL
    /// - `CANDLE_FORGE_BIND_ADDR` trigger API address
    /// - `CANDLE_FORGE_DB`        SQLite path
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(markets) = lookup("CANDLE_FORGE_MARKETS") {
            let parsed: Vec<String> = markets
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                self.markets = parsed;
            }
        }
        if let Some(url) = lookup("CANDLE_FORGE_REDIS_URL").filter(|u| !u.is_empty()) {
            self.cache.redis_url = Some(url);
        }
        if let Some(addr) = lookup("CANDLE_FORGE_BIND_ADDR").filter(|a| !a.is_empty()) {
            self.bind_addr = addr;
        }
        if let Some(db) = lookup("CANDLE_FORGE_DB").filter(|p| !p.is_empty()) {
            self.store.path = db;
        }
    }

    /// Configured start, rounded up to a minute boundary.
    pub fn start_timestamp(&self) -> Result<DateTime<Utc>> {
        let parsed = DateTime::parse_from_rfc3339(&self.backfill.start_date)
            .with_context(|| format!("invalid backfill.start_date '{}'", self.backfill.start_date))?;
        Ok(ceil_to_minute(parsed.with_timezone(&Utc)))
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.markets.is_empty() {
            bail!("markets must not be empty");
        }
        if self.exchange.provider != "upbit" {
            bail!("unsupported exchange provider '{}'", self.exchange.provider);
        }
        let b = &self.backfill;
        if b.max_batch_size == 0 || b.max_batch_size > MAX_COUNT {
            bail!("backfill.max_batch_size must be within 1..={MAX_COUNT}, got {}", b.max_batch_size);
        }
        if b.max_concurrency == 0 {
            bail!("backfill.max_concurrency must be at least 1");
        }
        if b.max_attempts == 0 {
            bail!("backfill.max_attempts must be at least 1");
        }
        if b.lock_ttl_secs == 0 {
            bail!("backfill.lock_ttl_secs must be positive");
        }
        if b.interval_secs == 0 || self.indicators.interval_secs == 0 || self.cache.reconcile_interval_secs == 0 {
            bail!("schedule intervals must be positive");
        }
        self.start_timestamp()?;
        self.exchange.reporting_offset()?;
        if self.cache.retention_days <= 0 || self.cache.reconcile_window_minutes <= 0 {
            bail!("cache.retention_days and cache.reconcile_window_minutes must be positive");
        }
        if self.indicators.candle_count == 0 || self.indicators.max_period == 0 {
            bail!("indicators.candle_count and indicators.max_period must be positive");
        }
        Ok(())
    }

    /// Orchestrator settings derived from the `backfill` and `exchange`
    /// sections.
    pub fn backfill_config(&self) -> Result<BackfillConfig> {
        let b = &self.backfill;
        Ok(BackfillConfig {
            start: self.start_timestamp()?,
            max_batch_size: b.max_batch_size,
            trailing_singleton: b.trailing_singleton,
            max_concurrency: b.max_concurrency,
            retry: RetryPolicy {
                max_attempts: b.max_attempts,
                base_backoff: Duration::from_millis(b.base_backoff_ms),
                max_backoff: Duration::from_millis(b.max_backoff_ms),
                rate_limit_backoff: Duration::from_secs(b.rate_limit_backoff_secs),
            },
            lock_ttl: Duration::from_secs(b.lock_ttl_secs),
            reporting_offset: self.exchange.reporting_offset()?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.markets, vec!["KRW-BTC", "KRW-ETH", "KRW-DOGE"]);
        assert_eq!(cfg.exchange.provider, "upbit");
        assert_eq!(cfg.backfill.max_batch_size, 200);
        assert_eq!(cfg.backfill.trailing_singleton, TrailingSingletonPolicy::Defer);
        assert_eq!(cfg.backfill.rate_limit_backoff_secs, 60);
        assert_eq!(cfg.cache.retention_days, 365);
        assert_eq!(cfg.indicators.candle_count, 100);
        assert_eq!(cfg.indicators.max_period, 500);
        assert_eq!(cfg.indicators.catalogue.len(), 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn start_date_is_kst_midnight() {
        let cfg = RuntimeConfig::default();
        assert_eq!(
            cfg.start_timestamp().unwrap(),
            Utc.with_ymd_and_hms(2020, 12, 31, 15, 0, 0).unwrap()
        );
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "markets": ["KRW-XRP"],
            "backfill": { "max_batch_size": 50, "trailing_singleton": "include" }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.markets, vec!["KRW-XRP"]);
        assert_eq!(cfg.backfill.max_batch_size, 50);
        assert_eq!(cfg.backfill.trailing_singleton, TrailingSingletonPolicy::Include);
        assert_eq!(cfg.backfill.max_attempts, 3);
        assert_eq!(cfg.exchange.base_url, "https://api.upbit.com");
    }

    #[test]
    fn validate_rejects_oversized_batches_and_bad_dates() {
        let mut cfg = RuntimeConfig::default();
        cfg.backfill.max_batch_size = 201;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.backfill.start_date = "yesterday".into();
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.markets.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_replace_selected_values() {
        let env: HashMap<&str, &str> = [
            ("CANDLE_FORGE_MARKETS", "KRW-BTC, KRW-SOL ,"),
            ("CANDLE_FORGE_REDIS_URL", "redis://cache:6379/0"),
            ("CANDLE_FORGE_DB", "/data/candles.db"),
        ]
        .into_iter()
        .collect();

        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.markets, vec!["KRW-BTC", "KRW-SOL"]);
        assert_eq!(cfg.cache.redis_url.as_deref(), Some("redis://cache:6379/0"));
        assert_eq!(cfg.store.path, "/data/candles.db");
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn backfill_config_carries_retry_policy() {
        let bc = RuntimeConfig::default().backfill_config().unwrap();
        assert_eq!(bc.retry.rate_limit_backoff, Duration::from_secs(60));
        assert_eq!(bc.reporting_offset.local_minus_utc(), 9 * 3600);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("candle-forge-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("candle_forge.json");

        let mut cfg = RuntimeConfig::default();
        cfg.markets = vec!["KRW-ETH".into()];
        cfg.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
