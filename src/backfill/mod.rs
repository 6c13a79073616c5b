pub mod gap;
pub mod orchestrator;
pub mod reconcile;

pub use gap::{GapAnalyzer, MissingBatch, TrailingSingletonPolicy};
pub use orchestrator::{
    lock_key, BackfillConfig, BackfillOrchestrator, BackfillReport, PassStatus, RetryPolicy,
};
pub use reconcile::{expected_minutes, reconcile, Reconciled};
