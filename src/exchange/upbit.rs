// =============================================================================
// Upbit REST client — public one-minute candle endpoint
// =============================================================================
//
//   GET /v1/candles/minutes/1?market=KRW-BTC&to=<KST ISO-8601>&count=<1..200>
//
// `to` is exclusive and is sent in the exchange's reporting timezone (KST).
// Candles come back newest first with `candle_date_time_utc` formatted as
// `%Y-%m-%dT%H:%M:%S` (no offset). No credentials are needed for this
// endpoint.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::errors::FetchError;
use crate::exchange::rate_limit::RemainingReqTracker;
use crate::exchange::{ExchangeClient, FetchOutcome, RawCandle};

/// Maximum candles Upbit returns for one request.
pub const MAX_COUNT: usize = 200;

const CANDLES_PATH: &str = "/v1/candles/minutes/1";
const UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One element of the candle response body. Unused fields are ignored.
#[derive(Debug, Deserialize)]
struct UpbitCandle {
    candle_date_time_utc: String,
    opening_price: f64,
    high_price: f64,
    low_price: f64,
    trade_price: f64,
    candle_acc_trade_price: f64,
    candle_acc_trade_volume: f64,
}

impl UpbitCandle {
    fn into_raw(self) -> Result<RawCandle, String> {
        let timestamp = NaiveDateTime::parse_from_str(&self.candle_date_time_utc, UTC_FORMAT)
            .map_err(|e| format!("bad candle_date_time_utc '{}': {e}", self.candle_date_time_utc))?
            .and_utc();
        Ok(RawCandle {
            timestamp,
            open: self.opening_price,
            high: self.high_price,
            low: self.low_price,
            close: self.trade_price,
            acc_trade_value: self.candle_acc_trade_price,
            acc_trade_volume: self.candle_acc_trade_volume,
        })
    }
}

/// Interpret a 2xx response body.
pub fn parse_candles(body: &str) -> FetchOutcome {
    let entries: Vec<UpbitCandle> = match serde_json::from_str(body) {
        Ok(e) => e,
        Err(e) => return FetchOutcome::Malformed(e.to_string()),
    };
    if entries.is_empty() {
        return FetchOutcome::Empty;
    }
    match entries.into_iter().map(UpbitCandle::into_raw).collect() {
        Ok(candles) => FetchOutcome::Candles(candles),
        Err(reason) => FetchOutcome::Malformed(reason),
    }
}

/// Format the exclusive `to` bound in the reporting timezone.
pub fn format_to(to: DateTime<Utc>, offset: FixedOffset) -> String {
    to.with_timezone(&offset)
        .format("%Y-%m-%dT%H:%M:%S%:z")
        .to_string()
}

/// Public-data Upbit client.
#[derive(Clone)]
pub struct UpbitClient {
    base_url: String,
    reporting_offset: FixedOffset,
    client: reqwest::Client,
    budget: std::sync::Arc<RemainingReqTracker>,
}

impl UpbitClient {
    /// Build a client for `base_url` (e.g. `https://api.upbit.com`).
    pub fn new(
        base_url: impl Into<String>,
        reporting_offset: FixedOffset,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        debug!(base_url = %base_url, "UpbitClient initialised");

        Ok(Self {
            base_url,
            reporting_offset,
            client,
            budget: std::sync::Arc::new(RemainingReqTracker::new()),
        })
    }

    pub fn budget(&self) -> &RemainingReqTracker {
        &self.budget
    }

    async fn wait_for_budget(&self) {
        if let Some(delay) = self.budget.throttle_delay() {
            debug!(delay_ms = delay.as_millis() as u64, "throttling before next request");
            tokio::time::sleep(delay).await;
            self.budget.reset_second_window();
        }
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl ExchangeClient for UpbitClient {
    fn provider(&self) -> &str {
        "upbit"
    }

    #[instrument(skip(self), name = "upbit::fetch_recent")]
    async fn fetch_recent(
        &self,
        market: &str,
        to: DateTime<Utc>,
        count: usize,
    ) -> Result<FetchOutcome, FetchError> {
        if count == 0 || count > MAX_COUNT {
            return Err(FetchError::InvalidRequest {
                reason: format!("count must be within 1..={MAX_COUNT}, got {count}"),
            });
        }

        self.wait_for_budget().await;

        let url = format!("{}{}", self.base_url, CANDLES_PATH);
        let to_param = format_to(to, self.reporting_offset);
        let count_param = count.to_string();

        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[
                ("market", market),
                ("to", to_param.as_str()),
                ("count", count_param.as_str()),
            ])
            .send()
            .await?;

        self.budget.update_from_headers(resp.headers());
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(resp.headers());
            warn!(market, ?retry_after, "Upbit returned 429");
            return Err(FetchError::RateLimited { retry_after });
        }

        let body = resp.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let outcome = parse_candles(&body);
        match &outcome {
            FetchOutcome::Malformed(reason) => {
                warn!(market, reason = %reason, "malformed candle response");
            }
            other => debug!(market, count = other.len(), "candles fetched"),
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for UpbitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpbitClient")
            .field("base_url", &self.base_url)
            .field("reporting_offset", &self.reporting_offset)
            .field("budget", &self.budget)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
