/// Storage layer
///
/// Owns the SQLite connection pool and schema shared by the step tree store
/// and the scan record store, plus the bounded retry loop used around writes
/// that may hit lock contention.

// SQLite pool creation and schema management
pub mod database;

// Bounded retry with exponential backoff for transient storage failures
pub mod retry;

pub use database::Database;
pub use retry::with_retry;
