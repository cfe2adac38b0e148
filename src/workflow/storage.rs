/// SQLite persistence layer for step trees
///
/// Stores one row per (token, step). Every status change is a guarded
/// conditional update (`WHERE status = <expected>`), so two callers racing on
/// the same node can never both win. Cascades run as one recursive update
/// inside the same transaction as the node they start from.

use crate::error::{Error, Result};
use crate::workflow::types::{StepKind, StepNode, StepStatus};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};
use uuid::Uuid;

/// Outcome of a guarded status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// The node was in the expected state and has been updated
    Applied,
    /// The node changed state since it was read; nothing was written
    Conflict,
}

/// SQLite-based step tree storage
#[derive(Debug, Clone)]
pub struct StepTreeStore {
    pool: SqlitePool,
}

impl StepTreeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a chain of PENDING nodes for `token`, each parented by the previous one
    ///
    /// The first node is parented by `root_parent` (a node of another run for
    /// sub-runs, `None` otherwise). Fails with `DuplicateRun` if any node for
    /// `token` already exists; the uniqueness constraint backs this up against
    /// concurrent creators.
    pub async fn insert_chain(
        &self,
        token: Uuid,
        stages: &[StepKind],
        root_parent: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StepNode>> {
        let mut tx = self.pool.begin().await?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM step_nodes WHERE token = ?")
            .bind(token.to_string())
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            return Err(Error::DuplicateRun { token });
        }

        let mut nodes = Vec::with_capacity(stages.len());
        let mut parent_id = root_parent;

        for step in stages {
            let inserted = sqlx::query(
                r#"
                INSERT INTO step_nodes (token, step, parent_id, status, started_at, updated_at, failure_reason)
                VALUES (?, ?, ?, ?, NULL, ?, NULL)
                RETURNING id
                "#,
            )
            .bind(token.to_string())
            .bind(step.as_str())
            .bind(parent_id)
            .bind(StepStatus::Pending.as_str())
            .bind(now)
            .fetch_one(&mut *tx)
            .await;

            let id: i64 = match inserted {
                Ok(row) => row.try_get("id")?,
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    return Err(Error::DuplicateRun { token });
                }
                Err(e) => return Err(e.into()),
            };

            nodes.push(StepNode {
                id,
                token,
                step: *step,
                parent_id,
                status: StepStatus::Pending,
                started_at: None,
                updated_at: now,
                failure_reason: None,
            });
            parent_id = Some(id);
        }

        tx.commit().await?;
        Ok(nodes)
    }

    /// All nodes of a run, in creation order
    pub async fn find_by_token(&self, token: Uuid) -> Result<Vec<StepNode>> {
        let rows = sqlx::query(
            r#"
            SELECT id, token, step, parent_id, status, started_at, updated_at, failure_reason
            FROM step_nodes
            WHERE token = ?
            ORDER BY id
            "#,
        )
        .bind(token.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    /// Retrieve a single node by run token and step
    pub async fn find(&self, token: Uuid, step: StepKind) -> Result<Option<StepNode>> {
        let row = sqlx::query(
            r#"
            SELECT id, token, step, parent_id, status, started_at, updated_at, failure_reason
            FROM step_nodes
            WHERE token = ? AND step = ?
            "#,
        )
        .bind(token.to_string())
        .bind(step.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    /// Nodes whose parent is `parent_id`, across runs
    pub async fn find_children(&self, parent_id: i64) -> Result<Vec<StepNode>> {
        let rows = sqlx::query(
            r#"
            SELECT id, token, step, parent_id, status, started_at, updated_at, failure_reason
            FROM step_nodes
            WHERE parent_id = ?
            ORDER BY id
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    /// Move node `id` from `from` to `to` if it is still in `from`
    ///
    /// `started_at` and `failure_reason` are only written when supplied.
    pub async fn transition(
        &self,
        id: i64,
        from: StepStatus,
        to: StepStatus,
        now: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        failure_reason: Option<&str>,
    ) -> Result<TransitionResult> {
        let result = sqlx::query(
            r#"
            UPDATE step_nodes
            SET status = ?,
                updated_at = ?,
                started_at = COALESCE(?, started_at),
                failure_reason = COALESCE(?, failure_reason)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(started_at)
        .bind(failure_reason)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            TransitionResult::Applied
        } else {
            TransitionResult::Conflict
        })
    }

    /// Terminate node `id` and cancel every non-terminal descendant, atomically
    ///
    /// Descendants are found by following parent links transitively, so the
    /// cascade reaches sub-runs chained off this node as well. All cancelled
    /// nodes receive the same `now`. Returns the number of cancelled
    /// descendants, or `None` when the node was no longer in `from` (nothing
    /// is written in that case).
    pub async fn terminate_with_cascade(
        &self,
        id: i64,
        from: StepStatus,
        to: StepStatus,
        now: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        failure_reason: Option<&str>,
    ) -> Result<Option<u64>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE step_nodes
            SET status = ?,
                updated_at = ?,
                started_at = COALESCE(?, started_at),
                failure_reason = COALESCE(?, failure_reason)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(started_at)
        .bind(failure_reason)
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        let cancelled = sqlx::query(
            r#"
            WITH RECURSIVE descendants(id) AS (
                SELECT id FROM step_nodes WHERE parent_id = ?
                UNION
                SELECT s.id FROM step_nodes s JOIN descendants d ON s.parent_id = d.id
            )
            UPDATE step_nodes
            SET status = ?, updated_at = ?
            WHERE id IN (SELECT id FROM descendants)
              AND status IN (?, ?)
            "#,
        )
        .bind(id)
        .bind(StepStatus::Cancelled.as_str())
        .bind(now)
        .bind(StepStatus::Pending.as_str())
        .bind(StepStatus::InProgress.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(cancelled.rows_affected()))
    }

    /// True iff at least one node of the run is PENDING or IN_PROGRESS
    pub async fn any_active(&self, token: Uuid) -> Result<bool> {
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM step_nodes WHERE token = ? AND status IN (?, ?)",
        )
        .bind(token.to_string())
        .bind(StepStatus::Pending.as_str())
        .bind(StepStatus::InProgress.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(active > 0)
    }

    /// Delete every node of a run; returns the number of deleted nodes
    pub async fn delete_by_token(&self, token: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM step_nodes WHERE token = ?")
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn node_from_row(row: &SqliteRow) -> Result<StepNode> {
    let token: String = row.try_get("token")?;
    let step: String = row.try_get("step")?;
    let status: String = row.try_get("status")?;

    Ok(StepNode {
        id: row.try_get("id")?,
        token: Uuid::parse_str(&token)
            .map_err(|e| Error::persistence(format!("invalid token '{token}': {e}")))?,
        step: step.parse().map_err(Error::persistence)?,
        parent_id: row.try_get("parent_id")?,
        status: status.parse().map_err(Error::persistence)?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}
