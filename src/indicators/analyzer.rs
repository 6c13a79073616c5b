// =============================================================================
// Technical Analyzer — batch entry point for the indicator engine
// =============================================================================
//
// Loads one window of candles (placeholders skipped) and evaluates a named
// set of indicators over it. A failing indicator is reported next to the
// successful ones and never aborts the batch.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{IndicatorError, StoreError};
use crate::indicators::bollinger::{calculate_bollinger, BollingerParams, BollingerRow};
use crate::indicators::ema::{calculate_ema, EmaParams, EmaRow};
use crate::indicators::ichimoku::{calculate_ichimoku, IchimokuParams, IchimokuRow};
use crate::indicators::keltner::{calculate_keltner, KeltnerParams, KeltnerRow};
use crate::indicators::macd::{calculate_macd, MacdParams, MacdRow};
use crate::indicators::rsi::{calculate_rsi, RsiParams, RsiRow};
use crate::indicators::stochastic::{calculate_stochastic, StochasticParams, StochasticRow};
use crate::indicators::vwap::{calculate_vwap, VwapParams, VwapRow};
use crate::market_data::{CandleStore, IndicatorRecord, PriceBar};

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// One indicator with its parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Rsi(RsiParams),
    Stochastic(StochasticParams),
    Ema(EmaParams),
    Bollinger(BollingerParams),
    Macd(MacdParams),
    Ichimoku(IchimokuParams),
    Keltner(KeltnerParams),
    Vwap(VwapParams),
}

impl IndicatorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rsi(_) => "rsi",
            Self::Stochastic(_) => "stochastic",
            Self::Ema(_) => "ema",
            Self::Bollinger(_) => "bollinger",
            Self::Macd(_) => "macd",
            Self::Ichimoku(_) => "ichimoku",
            Self::Keltner(_) => "keltner",
            Self::Vwap(_) => "vwap",
        }
    }

    /// Canonical, order-stable rendering of the parameters, used as part of
    /// the persisted row key.
    pub fn param_key(&self) -> String {
        match self {
            Self::Rsi(p) => format!("period={};mode={}", p.period, p.smoothing.as_str()),
            Self::Stochastic(p) => format!("k={};d={}", p.k_period, p.d_period),
            Self::Ema(p) => format!("period={}", p.period),
            Self::Bollinger(p) => format!("period={};deviation={}", p.period, p.deviation),
            Self::Macd(p) => format!(
                "short={};long={};signal={}",
                p.short_period, p.long_period, p.signal_period
            ),
            Self::Ichimoku(p) => format!(
                "tenkan={};kijun={};senkou_b={}",
                p.tenkan_period, p.kijun_period, p.senkou_b_period
            ),
            Self::Keltner(p) => format!(
                "ema={};atr={};multiplier={};mode={}",
                p.ema_period,
                p.atr_period,
                p.multiplier,
                p.atr_smoothing.as_str()
            ),
            Self::Vwap(p) => format!("period={}", p.period),
        }
    }

    pub fn compute(
        &self,
        bars: &[PriceBar],
        candle_count: usize,
    ) -> Result<IndicatorSeries, IndicatorError> {
        Ok(match self {
            Self::Rsi(p) => IndicatorSeries::Rsi(calculate_rsi(bars, p, candle_count)?),
            Self::Stochastic(p) => {
                IndicatorSeries::Stochastic(calculate_stochastic(bars, p, candle_count)?)
            }
            Self::Ema(p) => IndicatorSeries::Ema(calculate_ema(bars, p, candle_count)?),
            Self::Bollinger(p) => {
                IndicatorSeries::Bollinger(calculate_bollinger(bars, p, candle_count)?)
            }
            Self::Macd(p) => IndicatorSeries::Macd(calculate_macd(bars, p, candle_count)?),
            Self::Ichimoku(p) => {
                IndicatorSeries::Ichimoku(calculate_ichimoku(bars, p, candle_count)?)
            }
            Self::Keltner(p) => IndicatorSeries::Keltner(calculate_keltner(bars, p, candle_count)?),
            Self::Vwap(p) => IndicatorSeries::Vwap(calculate_vwap(bars, p, candle_count)?),
        })
    }
}

/// A catalogue entry: the name callers select by, and what it computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedIndicator {
    pub name: String,
    pub spec: IndicatorSpec,
}

impl NamedIndicator {
    pub fn new(name: impl Into<String>, spec: IndicatorSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

/// The standard indicator set.
pub fn default_catalogue() -> Vec<NamedIndicator> {
    vec![
        NamedIndicator::new("rsi", IndicatorSpec::Rsi(RsiParams::default())),
        NamedIndicator::new("stochastic", IndicatorSpec::Stochastic(StochasticParams::default())),
        NamedIndicator::new("ema_short", IndicatorSpec::Ema(EmaParams { period: 9 })),
        NamedIndicator::new("ema_medium", IndicatorSpec::Ema(EmaParams { period: 20 })),
        NamedIndicator::new("ema_long", IndicatorSpec::Ema(EmaParams { period: 50 })),
        NamedIndicator::new("bollinger", IndicatorSpec::Bollinger(BollingerParams::default())),
        NamedIndicator::new("macd", IndicatorSpec::Macd(MacdParams::default())),
        NamedIndicator::new("ichimoku", IndicatorSpec::Ichimoku(IchimokuParams::default())),
        NamedIndicator::new("keltner", IndicatorSpec::Keltner(KeltnerParams::default())),
        NamedIndicator::new("vwap", IndicatorSpec::Vwap(VwapParams::default())),
    ]
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum IndicatorSeries {
    Rsi(Vec<RsiRow>),
    Stochastic(Vec<StochasticRow>),
    Ema(Vec<EmaRow>),
    Bollinger(Vec<BollingerRow>),
    Macd(Vec<MacdRow>),
    Ichimoku(Vec<IchimokuRow>),
    Keltner(Vec<KeltnerRow>),
    Vwap(Vec<VwapRow>),
}

/// (timestamp, serialized row) pairs for any row type.
fn row_values<T: Serialize>(
    rows: &[T],
    timestamp: impl Fn(&T) -> DateTime<Utc>,
) -> Result<Vec<(DateTime<Utc>, serde_json::Value)>, serde_json::Error> {
    rows.iter()
        .map(|r| Ok((timestamp(r), serde_json::to_value(r)?)))
        .collect()
}

impl IndicatorSeries {
    pub fn len(&self) -> usize {
        match self {
            Self::Rsi(r) => r.len(),
            Self::Stochastic(r) => r.len(),
            Self::Ema(r) => r.len(),
            Self::Bollinger(r) => r.len(),
            Self::Macd(r) => r.len(),
            Self::Ichimoku(r) => r.len(),
            Self::Keltner(r) => r.len(),
            Self::Vwap(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn values(&self) -> Result<Vec<(DateTime<Utc>, serde_json::Value)>, serde_json::Error> {
        match self {
            Self::Rsi(r) => row_values(r, |x| x.timestamp),
            Self::Stochastic(r) => row_values(r, |x| x.timestamp),
            Self::Ema(r) => row_values(r, |x| x.timestamp),
            Self::Bollinger(r) => row_values(r, |x| x.timestamp),
            Self::Macd(r) => row_values(r, |x| x.timestamp),
            Self::Ichimoku(r) => row_values(r, |x| x.timestamp),
            Self::Keltner(r) => row_values(r, |x| x.timestamp),
            Self::Vwap(r) => row_values(r, |x| x.timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorOutput {
    pub indicator: String,
    pub params: String,
    pub series: IndicatorSeries,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub market: String,
    pub candle_count: usize,
    /// Number of bars the indicators were computed over.
    pub window: usize,
    pub results: BTreeMap<String, IndicatorOutput>,
    /// Catalogue name -> reason, for indicators that could not be computed.
    pub failures: BTreeMap<String, String>,
}

impl AnalysisReport {
    /// Flatten every successful series into persistable rows.
    pub fn records(&self) -> Result<Vec<IndicatorRecord>, serde_json::Error> {
        let mut out = Vec::new();
        for output in self.results.values() {
            for (timestamp, values) in output.series.values()? {
                out.push(IndicatorRecord {
                    market: self.market.clone(),
                    timestamp,
                    indicator: output.indicator.clone(),
                    params: output.params.clone(),
                    values,
                });
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct TechnicalAnalyzer {
    store: Arc<dyn CandleStore>,
    catalogue: Vec<NamedIndicator>,
    max_period: usize,
}

impl TechnicalAnalyzer {
    pub fn new(store: Arc<dyn CandleStore>, catalogue: Vec<NamedIndicator>, max_period: usize) -> Self {
        Self {
            store,
            catalogue,
            max_period,
        }
    }

    pub fn catalogue(&self) -> &[NamedIndicator] {
        &self.catalogue
    }

    /// The most recent `max_period` stored minutes as dense bars.
    pub async fn load_window(&self, market: &str) -> Result<Vec<PriceBar>, StoreError> {
        let candles = self
            .store
            .get_range(market, None, None, Some(self.max_period))
            .await?;
        let loaded = candles.len();
        let bars: Vec<PriceBar> = candles.iter().filter_map(|c| c.bar()).collect();
        debug!(market, loaded, bars = bars.len(), "indicator window loaded");
        Ok(bars)
    }

    /// Load the window for `market` and evaluate `selection` (all when `None`).
    pub async fn analyze(
        &self,
        market: &str,
        selection: Option<&[String]>,
        candle_count: usize,
    ) -> Result<AnalysisReport, StoreError> {
        let bars = self.load_window(market).await?;
        let report = self.analyze_bars(market, &bars, selection, candle_count);
        info!(
            market,
            computed = report.results.len(),
            failed = report.failures.len(),
            candle_count,
            "technical analysis complete"
        );
        Ok(report)
    }

    /// Evaluate over an already-loaded window.
    pub fn analyze_bars(
        &self,
        market: &str,
        bars: &[PriceBar],
        selection: Option<&[String]>,
        candle_count: usize,
    ) -> AnalysisReport {
        let mut report = AnalysisReport {
            market: market.to_string(),
            candle_count,
            window: bars.len(),
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
        };

        let chosen: Vec<&NamedIndicator> = match selection {
            None => self.catalogue.iter().collect(),
            Some(names) => {
                let mut chosen = Vec::with_capacity(names.len());
                for name in names {
                    match self.catalogue.iter().find(|n| &n.name == name) {
                        Some(entry) => chosen.push(entry),
                        None => {
                            warn!(market, indicator = %name, "unknown indicator requested");
                            report
                                .failures
                                .insert(name.clone(), "unknown indicator".to_string());
                        }
                    }
                }
                chosen
            }
        };

        for entry in chosen {
            match entry.spec.compute(bars, candle_count) {
                Ok(series) => {
                    report.results.insert(
                        entry.name.clone(),
                        IndicatorOutput {
                            indicator: entry.spec.kind().to_string(),
                            params: entry.spec.param_key(),
                            series,
                        },
                    );
                }
                Err(e) => {
                    warn!(market, indicator = %entry.name, error = %e, "indicator failed");
                    report.failures.insert(entry.name.clone(), e.to_string());
                }
            }
        }
        report
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
