// =============================================================================
// REST Trigger API — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Triggers are idempotent and run to
// completion before responding; the response body is the trigger's report.
//
// CORS is configured permissively; the service is meant to sit behind an
// internal network boundary.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::backfill::PassStatus;
use crate::tasks::{self, is_valid_market};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn check_market(market: &str) -> Result<(), ApiError> {
    if is_valid_market(market) {
        Ok(())
    } else {
        Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid market code: '{market}'. Expected e.g. 'KRW-BTC'."),
        ))
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the trigger API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/indicators", get(catalogue))
        // ── Triggers ────────────────────────────────────────────────
        .route("/api/v1/backfill/:market", post(backfill))
        .route("/api/v1/indicators/:market", post(indicators))
        .route("/api/v1/cache/reconcile/:market", post(cache_reconcile))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_health())
}

async fn catalogue(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.analyzer.catalogue().to_vec())
}

// =============================================================================
// Backfill
// =============================================================================

async fn backfill(
    State(state): State<Arc<AppState>>,
    Path(market): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_market(&market)?;
    info!(market = %market, "backfill triggered via API");

    let report = tasks::trigger_backfill(&state, &market)
        .await
        .map_err(internal)?;

    // Another pass owns the provider lock; nothing ran.
    let status = if report.status == PassStatus::AlreadyRunning {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

// =============================================================================
// Indicators
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct IndicatorRequest {
    /// Catalogue names; the whole catalogue when absent.
    #[serde(default)]
    indicators: Option<Vec<String>>,
    /// Rows per indicator; the configured default when absent.
    #[serde(default)]
    candle_count: Option<usize>,
}

async fn indicators(
    State(state): State<Arc<AppState>>,
    Path(market): Path<String>,
    body: Option<Json<IndicatorRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    check_market(&market)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();

    if req.candle_count == Some(0) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "candle_count must be at least 1",
        ));
    }
    if let Some(names) = &req.indicators {
        let unknown: Vec<&String> = names
            .iter()
            .filter(|n| !state.analyzer.catalogue().iter().any(|c| &c.name == *n))
            .collect();
        if !unknown.is_empty() {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("Unknown indicators: {unknown:?}"),
            ));
        }
    }

    info!(market = %market, selection = ?req.indicators, "indicator batch triggered via API");

    let report = tasks::trigger_indicator_batch(
        &state,
        &market,
        req.indicators.as_deref(),
        req.candle_count,
    )
    .await
    .map_err(internal)?;

    Ok(Json(report))
}

// =============================================================================
// Cache reconciliation
// =============================================================================

async fn cache_reconcile(
    State(state): State<Arc<AppState>>,
    Path(market): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_market(&market)?;

    let report = tasks::trigger_cache_reconcile(&state, &market)
        .await
        .map_err(internal)?;
    Ok(Json(report))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::tests::{memory_state, recent_config};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn post(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, _) = memory_state(recent_config(5));
        let (status, body) = send(
            router(state),
            Request::get("/api/v1/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["provider"], "stub");
    }

    #[tokio::test]
    async fn catalogue_lists_default_indicators() {
        let (state, _) = memory_state(recent_config(5));
        let (status, body) = send(
            router(state),
            Request::get("/api/v1/indicators").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(10));
    }

    #[tokio::test]
    async fn backfill_trigger_returns_report() {
        let (state, store) = memory_state(recent_config(5));
        let (status, body) = send(router(state), post("/api/v1/backfill/KRW-BTC")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["market"], "KRW-BTC");
        assert_eq!(body["status"], "completed");
        assert!(store.count("KRW-BTC") > 0);
    }

    #[tokio::test]
    async fn held_lock_yields_conflict() {
        let (state, _) = memory_state(recent_config(5));
        state
            .cache
            .set_if_absent(
                &crate::backfill::lock_key("stub"),
                "another-run",
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap();

        let (status, body) = send(router(state), post("/api/v1/backfill/KRW-BTC")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "already_running");
    }

    #[tokio::test]
    async fn bad_market_is_rejected() {
        let (state, _) = memory_state(recent_config(5));
        let (status, body) = send(router(state), post("/api/v1/backfill/btc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("btc"));
    }

    #[tokio::test]
    async fn indicator_trigger_accepts_empty_body() {
        let (state, _) = memory_state(recent_config(5));
        let (status, body) = send(router(state), post("/api/v1/indicators/KRW-ETH")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["analysis"]["candle_count"], 100);
        assert_eq!(body["persisted"]["inserted"], 0);
    }

    #[tokio::test]
    async fn indicator_trigger_validates_request() {
        let (state, _) = memory_state(recent_config(5));
        let app = router(state);

        let (status, _) = send(
            app.clone(),
            post_json("/api/v1/indicators/KRW-ETH", serde_json::json!({ "candle_count": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            app,
            post_json(
                "/api/v1/indicators/KRW-ETH",
                serde_json::json!({ "indicators": ["rsi", "adx"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("adx"));
    }

    #[tokio::test]
    async fn cache_reconcile_trigger_on_empty_store() {
        let (state, _) = memory_state(recent_config(5));
        let (status, body) = send(router(state), post("/api/v1/cache/reconcile/KRW-BTC")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["republished"], 0);
    }
}
