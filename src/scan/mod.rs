/// Phase Aggregation Layer
///
/// Tracks fan-out phases (scans) and counts the partial results workers
/// report for them:
/// - Type definitions (ScanRecord, ScanStatus, PartialResult)
/// - SQLite persistence with a single-statement atomic counter update
/// - Bounded ArcSwap cache of closed records
/// - The aggregator that turns reports into one completion signal

pub mod types;

pub mod storage;

pub mod cache;

pub mod aggregator;

pub use aggregator::PhaseAggregator;
pub use cache::PhaseCache;
pub use storage::ScanRecordStore;
pub use types::{NewPhase, PartialResult, ScanRecord, ScanStatus, TargetType};
