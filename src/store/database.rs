/// SQLite database handle for step trees and scan records
///
/// One pool serves both stores. Counters and step transitions rely on
/// single-statement conditional updates, so the only concurrency setting that
/// matters here is the busy timeout writers wait on before giving up.

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Shared SQLite connection pool with the scanflow schema applied
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database described by `config`
    ///
    /// Creates the parent directory of file-backed databases and applies the
    /// schema. Safe to call against an existing database.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::error::Error::persistence(format!(
                        "failed to create database directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        tracing::info!("🗄️ Opening scanflow database: {}", config.url);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.init_schema().await?;
        Ok(database)
    }

    /// Private in-memory database, used by tests and the demo binary
    ///
    /// An in-memory SQLite database lives exactly as long as its connection,
    /// so the pool is pinned to one connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.init_schema().await?;
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes (uses IF NOT EXISTS)
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT NOT NULL,
                step TEXT NOT NULL,
                parent_id INTEGER REFERENCES step_nodes(id) ON DELETE SET NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                updated_at TEXT NOT NULL,
                failure_reason TEXT,
                UNIQUE (token, step)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Cascades walk parent links downwards
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_step_nodes_parent ON step_nodes(parent_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_records (
                token TEXT PRIMARY KEY,
                target_type TEXT NOT NULL,
                target_identifier TEXT NOT NULL,
                owner_token TEXT,
                owner_step TEXT,
                expected_results INTEGER NOT NULL,
                received_results INTEGER NOT NULL DEFAULT 0,
                scan_total INTEGER NOT NULL DEFAULT 0,
                scan_failed INTEGER NOT NULL DEFAULT 0,
                failure_threshold REAL NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scan_records_status_updated ON scan_records(status, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
