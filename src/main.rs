// =============================================================================
// candle-forge — Main Entry Point
// =============================================================================
//
// `serve` (the default) runs the periodic backfill, indicator and cache
// reconciliation loops plus the HTTP trigger API until Ctrl+C. The other
// subcommands run a single trigger and print its report as JSON.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candle_forge::app_state::AppState;
use candle_forge::cache::{MemoryCache, RedisCache, SharedCache};
use candle_forge::exchange::{ExchangeClient, UpbitClient};
use candle_forge::market_data::SqliteCandleStore;
use candle_forge::runtime_config::{config_path, RuntimeConfig};
use candle_forge::{api, tasks};

#[derive(Parser)]
#[command(name = "candle-forge")]
#[command(about = "Minute-candle backfill and technical indicators.", version)]
struct Cli {
    /// Config file (defaults to $CANDLE_FORGE_CONFIG or candle_forge.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run schedules and the trigger API until Ctrl+C.
    Serve,
    /// Run one backfill pass for a market.
    Backfill { market: String },
    /// Compute and persist indicators for a market.
    Indicators {
        market: String,
        /// Catalogue names, comma-separated (all when omitted).
        #[arg(long = "set", value_delimiter = ',')]
        set: Vec<String>,
        /// Rows per indicator.
        #[arg(long)]
        count: Option<usize>,
    },
    /// Republish stored candles missing from the cache.
    ReconcileCache { market: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config_path);

    let mut config = RuntimeConfig::load_or_default(&path);
    config.apply_env_overrides();
    config.validate().context("runtime config rejected")?;

    info!(
        markets = ?config.markets,
        provider = %config.exchange.provider,
        store = %config.store.path,
        "candle-forge starting"
    );

    // ── 2. Components & shared state ─────────────────────────────────────
    let state = Arc::new(build_state(config).await?);

    // ── 3. Dispatch ──────────────────────────────────────────────────────
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(state).await,
        Commands::Backfill { market } => {
            cancel_on_ctrl_c(&state);
            print_json(&tasks::trigger_backfill(&state, &market).await?)
        }
        Commands::Indicators { market, set, count } => {
            let selection = (!set.is_empty()).then_some(set);
            let report =
                tasks::trigger_indicator_batch(&state, &market, selection.as_deref(), count)
                    .await?;
            print_json(&report)
        }
        Commands::ReconcileCache { market } => {
            print_json(&tasks::trigger_cache_reconcile(&state, &market).await?)
        }
    }
}

async fn build_state(config: RuntimeConfig) -> Result<AppState> {
    let store = Arc::new(
        SqliteCandleStore::open(&config.store.path)
            .with_context(|| format!("failed to open candle store at {}", config.store.path))?,
    );

    let exchange: Arc<dyn ExchangeClient> = Arc::new(
        UpbitClient::new(
            config.exchange.base_url.clone(),
            config.exchange.reporting_offset()?,
            config.exchange.request_timeout(),
        )
        .context("failed to build exchange client")?,
    );

    let cache: Arc<dyn SharedCache> = match &config.cache.redis_url {
        Some(url) => Arc::new(
            RedisCache::connect(url)
                .await
                .context("failed to connect to Redis")?,
        ),
        None => {
            warn!("no Redis URL configured, using in-process cache (single instance only)");
            Arc::new(MemoryCache::new())
        }
    };

    AppState::new(config, exchange, store, cache)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cancel_on_ctrl_c(state: &Arc<AppState>) {
    let token = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
}

/// Run `tick` for every configured market each `every`, until shutdown.
fn spawn_schedule<F, Fut>(state: Arc<AppState>, name: &'static str, every: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<AppState>, String) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            for market in state.config.markets.clone() {
                if state.shutdown.is_cancelled() {
                    break;
                }
                if let Err(e) = tick(state.clone(), market.clone()).await {
                    error!(schedule = name, market = %market, error = %format!("{e:#}"), "scheduled run failed");
                }
            }
        }
        info!(schedule = name, "schedule stopped");
    })
}

async fn serve(state: Arc<AppState>) -> Result<()> {
    // ── 4. Schedules ─────────────────────────────────────────────────────
    let schedules = vec![
        spawn_schedule(
            state.clone(),
            "backfill",
            Duration::from_secs(state.config.backfill.interval_secs),
            |s, m| async move { tasks::trigger_backfill(&s, &m).await.map(drop) },
        ),
        spawn_schedule(
            state.clone(),
            "indicators",
            Duration::from_secs(state.config.indicators.interval_secs),
            |s, m| async move {
                tasks::trigger_indicator_batch(&s, &m, None, None).await.map(drop)
            },
        ),
        spawn_schedule(
            state.clone(),
            "cache_reconcile",
            Duration::from_secs(state.config.cache.reconcile_interval_secs),
            |s, m| async move { tasks::trigger_cache_reconcile(&s, &m).await.map(drop) },
        ),
    ];
    info!(count = schedules.len(), "schedules launched");

    // ── 5. Trigger API ───────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {}", state.config.bind_addr))?;
    info!(addr = %state.config.bind_addr, "API server listening");

    let app = api::router(state.clone());
    let server_shutdown = state.shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");
    state.shutdown.cancel();

    for handle in schedules {
        if let Err(e) = handle.await {
            error!(error = %e, "schedule task panicked");
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    info!("candle-forge shut down complete.");
    Ok(())
}
