// =============================================================================
// Typed error hierarchy for candle-forge
// =============================================================================
//
// Library-internal errors use specific variants; entry points (main.rs,
// tasks.rs, config loading) wrap them with `anyhow::Context`.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Failure while talking to the upstream exchange.
///
/// Empty or malformed bodies are *not* errors; they surface as
/// [`crate::exchange::FetchOutcome`] variants.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("rate limited by exchange (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("exchange returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request to exchange failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl FetchError {
    /// Whether the failure is worth retrying with the generic backoff.
    ///
    /// Rate limiting is handled on its own, longer schedule and is therefore
    /// not reported as transient here.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::RateLimited { .. } | Self::InvalidRequest { .. } => false,
        }
    }
}

/// Failure inside a candle or indicator store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error("invalid stored timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("store worker failed: {0}")]
    Worker(String),
}

/// Failure inside the shared (secondary) cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Parameter validation failure for an indicator computation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndicatorError {
    #[error("{indicator}: invalid parameter {parameter}: {reason}")]
    InvalidParameter {
        indicator: &'static str,
        parameter: &'static str,
        reason: String,
    },
}

/// Failure that aborts a whole backfill pass (single-batch failures never do).
#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let server = FetchError::Status {
            status: 503,
            body: String::new(),
        };
        let client = FetchError::Status {
            status: 400,
            body: String::new(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
    }

    #[test]
    fn rate_limit_is_not_generic_transient() {
        let err = FetchError::RateLimited { retry_after: None };
        assert!(!err.is_transient());
    }

    #[test]
    fn indicator_error_message_names_parameter() {
        let err = IndicatorError::InvalidParameter {
            indicator: "rsi",
            parameter: "period",
            reason: "must be at least 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "rsi: invalid parameter period: must be at least 1"
        );
    }
}
