pub mod candle;
pub mod memory_store;
pub mod sqlite_store;
pub mod store;

// Flat re-exports so callers can write `use crate::market_data::Candle`.
pub use candle::{ceil_to_minute, is_minute_aligned, one_minute, truncate_to_minute, Candle, PriceBar};
pub use memory_store::MemoryCandleStore;
pub use sqlite_store::SqliteCandleStore;
pub use store::{CandleStore, IndicatorRecord, IndicatorStore, UpsertSummary};
