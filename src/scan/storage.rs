/// SQLite persistence layer for scan records
///
/// Because result ingestion is called once per worker report, the counter
/// path is a single `UPDATE ... RETURNING` statement instead of a
/// read-then-write pair: the increment, the completion check and the read of
/// the new state happen in one indivisible step, so no locking is needed.

use crate::error::{Error, Result};
use crate::scan::types::{ScanRecord, ScanStatus};
use crate::workflow::types::{StepRef, StepStatus};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "token, target_type, target_identifier, owner_token, owner_step, \
     expected_results, received_results, scan_total, scan_failed, failure_threshold, \
     status, started_at, updated_at";

/// SQLite-based scan record storage
#[derive(Debug, Clone)]
pub struct ScanRecordStore {
    pool: SqlitePool,
}

impl ScanRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new record; `DuplicatePhase` if the token is already tracked
    pub async fn insert(&self, record: &ScanRecord) -> Result<()> {
        let (scan_total, scan_failed) = (to_column(record.scan_total)?, to_column(record.scan_failed)?);
        let result = sqlx::query(
            r#"
            INSERT INTO scan_records (
                token, target_type, target_identifier, owner_token, owner_step,
                expected_results, received_results, scan_total, scan_failed,
                failure_threshold, status, started_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.token.to_string())
        .bind(record.target_type.as_str())
        .bind(record.target_identifier.to_string())
        .bind(record.owner.map(|owner| owner.token.to_string()))
        .bind(record.owner.map(|owner| owner.step.as_str()))
        .bind(record.expected_results)
        .bind(record.received_results)
        .bind(scan_total)
        .bind(scan_failed)
        .bind(record.failure_threshold)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(Error::DuplicatePhase { token: record.token })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retrieve a record by token
    pub async fn find(&self, token: Uuid) -> Result<Option<ScanRecord>> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM scan_records WHERE token = ?"))
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Count one report and add its scanner totals, atomically
    ///
    /// Only an IN_PROGRESS record below its expected count is touched, so
    /// late or duplicate reports can never push `received_results` past
    /// `expected_results`. The status flips to COMPLETED in the same
    /// statement that performs the final increment. Returns the post-update
    /// record, or `None` when no row was updated (unknown token, or the phase
    /// is no longer open).
    pub async fn record_result(
        &self,
        token: Uuid,
        result_count: u32,
        failed_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE scan_records
            SET received_results = received_results + 1,
                scan_total = scan_total + ?,
                scan_failed = scan_failed + ?,
                status = CASE
                    WHEN expected_results = received_results + 1 THEN ?
                    ELSE ?
                END,
                updated_at = ?
            WHERE token = ?
              AND status = ?
              AND received_results < expected_results
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(result_count)
        .bind(failed_count)
        .bind(ScanStatus::Completed.as_str())
        .bind(ScanStatus::InProgress.as_str())
        .bind(now)
        .bind(token.to_string())
        .bind(ScanStatus::InProgress.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Overwrite the status without touching counters
    pub async fn update_status(
        &self,
        token: Uuid,
        status: ScanStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanRecord>> {
        let row = sqlx::query(&format!(
            "UPDATE scan_records SET status = ?, updated_at = ? WHERE token = ? RETURNING {RECORD_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(now)
        .bind(token.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Close a phase that is still IN_PROGRESS; `None` if it already closed
    pub async fn close_if_open(
        &self,
        token: Uuid,
        status: ScanStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<ScanRecord>> {
        let row = sqlx::query(&format!(
            "UPDATE scan_records SET status = ?, updated_at = ? WHERE token = ? AND status = ? RETURNING {RECORD_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(now)
        .bind(token.to_string())
        .bind(ScanStatus::InProgress.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// IN_PROGRESS records last updated before `cutoff`, oldest first
    pub async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM scan_records WHERE status = ? AND updated_at < ? ORDER BY updated_at"
        ))
        .bind(ScanStatus::InProgress.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Closed records whose owning step is still IN_PROGRESS
    ///
    /// A phase closes before its owner is settled, so a failure in between
    /// leaves the step waiting on a signal that will not be sent again.
    /// Only records last updated before `cutoff` are returned, which keeps
    /// settlements still in flight out of the result.
    pub async fn find_unsettled(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {columns}
            FROM scan_records r
            JOIN step_nodes s ON s.token = r.owner_token AND s.step = r.owner_step
            WHERE r.status IN (?, ?)
              AND s.status = ?
              AND r.updated_at < ?
            ORDER BY r.updated_at
            "#,
            columns = qualified_columns("r")
        ))
        .bind(ScanStatus::Completed.as_str())
        .bind(ScanStatus::Failed.as_str())
        .bind(StepStatus::InProgress.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Delete a record by token
    pub async fn delete(&self, token: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scan_records WHERE token = ?")
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::persistence(format!("invalid uuid '{value}': {e}")))
}

fn qualified_columns(alias: &str) -> String {
    RECORD_COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_column(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::invalid_input(format!("counter {value} out of range")))
}

fn counter(row: &SqliteRow, column: &str) -> Result<u64> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| Error::persistence(format!("negative {column}: {value}")))
}

fn record_from_row(row: &SqliteRow) -> Result<ScanRecord> {
    let token: String = row.try_get("token")?;
    let target_type: String = row.try_get("target_type")?;
    let target_identifier: String = row.try_get("target_identifier")?;
    let owner_token: Option<String> = row.try_get("owner_token")?;
    let owner_step: Option<String> = row.try_get("owner_step")?;
    let status: String = row.try_get("status")?;

    let owner = match (owner_token, owner_step) {
        (Some(token), Some(step)) => Some(StepRef::new(
            parse_uuid(&token)?,
            step.parse().map_err(Error::persistence)?,
        )),
        _ => None,
    };

    Ok(ScanRecord {
        token: parse_uuid(&token)?,
        target_type: target_type.parse().map_err(Error::persistence)?,
        target_identifier: parse_uuid(&target_identifier)?,
        owner,
        expected_results: row.try_get("expected_results")?,
        received_results: row.try_get("received_results")?,
        scan_total: counter(row, "scan_total")?,
        scan_failed: counter(row, "scan_failed")?,
        failure_threshold: row.try_get("failure_threshold")?,
        status: status.parse().map_err(Error::persistence)?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::types::TargetType;
    use crate::store::Database;
    use crate::workflow::types::StepKind;

    async fn store() -> ScanRecordStore {
        let database = Database::in_memory().await.unwrap();
        ScanRecordStore::new(database.pool().clone())
    }

    fn record(expected: u32) -> ScanRecord {
        let now = Utc::now();
        ScanRecord {
            token: Uuid::new_v4(),
            target_type: TargetType::Project,
            target_identifier: Uuid::new_v4(),
            owner: Some(StepRef::new(Uuid::new_v4(), StepKind::VulnAnalysis)),
            expected_results: expected,
            received_results: 0,
            scan_total: 0,
            scan_failed: 0,
            failure_threshold: 0.05,
            status: ScanStatus::InProgress,
            started_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_find_preserve_every_field() {
        let store = store().await;
        let record = record(4);
        store.insert(&record).await.unwrap();

        let found = store.find(record.token).await.unwrap().unwrap();
        assert_eq!(found, record);
    }

    #[tokio::test]
    async fn final_increment_flips_status_in_the_same_statement() {
        let store = store().await;
        let record = record(2);
        store.insert(&record).await.unwrap();

        let first = store.record_result(record.token, 3, 1, Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.status, ScanStatus::InProgress);
        assert_eq!(first.received_results, 1);

        let second = store.record_result(record.token, 2, 0, Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.status, ScanStatus::Completed);
        assert_eq!((second.received_results, second.scan_total, second.scan_failed), (2, 5, 1));
    }

    #[tokio::test]
    async fn closed_phase_rejects_further_increments() {
        let store = store().await;
        let record = record(1);
        store.insert(&record).await.unwrap();

        store.record_result(record.token, 1, 0, Utc::now()).await.unwrap();
        assert!(store.record_result(record.token, 1, 0, Utc::now()).await.unwrap().is_none());

        let found = store.find(record.token).await.unwrap().unwrap();
        assert_eq!(found.received_results, 1);
        assert_eq!(found.scan_total, 1);
    }

    #[tokio::test]
    async fn totals_accumulate_past_a_single_report_range() {
        let store = store().await;
        let record = record(2);
        store.insert(&record).await.unwrap();

        store.record_result(record.token, u32::MAX, 0, Utc::now()).await.unwrap();
        let done = store
            .record_result(record.token, u32::MAX, u32::MAX, Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(done.status, ScanStatus::Completed);
        assert_eq!(done.scan_total, 2 * u64::from(u32::MAX));
        assert_eq!(done.scan_failed, u64::from(u32::MAX));
    }

    #[tokio::test]
    async fn unsettled_lists_closed_phases_with_active_owners() {
        let database = Database::in_memory().await.unwrap();
        let store = ScanRecordStore::new(database.pool().clone());
        let steps = crate::workflow::storage::StepTreeStore::new(database.pool().clone());
        let run = Uuid::new_v4();
        let nodes = steps
            .insert_chain(run, &[StepKind::VulnAnalysis], None, Utc::now())
            .await
            .unwrap();
        steps
            .transition(nodes[0].id, StepStatus::Pending, StepStatus::InProgress, Utc::now(), Some(Utc::now()), None)
            .await
            .unwrap();

        let mut owned = record(1);
        owned.owner = Some(StepRef::new(run, StepKind::VulnAnalysis));
        let orphan = record(1);
        store.insert(&owned).await.unwrap();
        store.insert(&orphan).await.unwrap();
        store.record_result(owned.token, 1, 0, Utc::now()).await.unwrap();
        store.record_result(orphan.token, 1, 0, Utc::now()).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let unsettled = store.find_unsettled(later).await.unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].token, owned.token);
        assert!(store.find_unsettled(Utc::now() - chrono::Duration::seconds(60)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_token_is_rejected() {
        let store = store().await;
        let record = record(1);
        store.insert(&record).await.unwrap();

        let err = store.insert(&record).await.unwrap_err();
        assert!(matches!(err, Error::DuplicatePhase { token } if token == record.token));
    }
}
