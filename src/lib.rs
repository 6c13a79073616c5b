// =============================================================================
// candle-forge — minute-candle backfill and technical indicator service
// =============================================================================

pub mod api;
pub mod app_state;
pub mod backfill;
pub mod cache;
pub mod errors;
pub mod exchange;
pub mod indicators;
pub mod market_data;
pub mod runtime_config;
pub mod tasks;
