/// Workflow engine: the step tree state machine
///
/// Materializes stage sequences into step trees and applies start / complete /
/// fail / cancel transitions on top of [`StepTreeStore`]. Transitions are
/// validated against the node's current state, then written with a guarded
/// update; if another caller moved the node in between, the caller gets
/// `InvalidTransition` computed from the fresh state.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::store::with_retry;
use crate::workflow::storage::{StepTreeStore, TransitionResult};
use crate::workflow::types::{PipelineKind, StepKind, StepNode, StepRef, StepStatus};
use chrono::Utc;
use uuid::Uuid;

/// Result of a fail or cancel call
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    /// The node that was terminated, as persisted
    pub node: StepNode,
    /// How many descendants were moved to CANCELLED
    pub cancelled_descendants: u64,
}

/// State machine over the step tree store
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    store: StepTreeStore,
    retry: RetryConfig,
}

impl WorkflowEngine {
    pub fn new(store: StepTreeStore, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Create the PENDING step chain for a new run
    pub async fn create_run(&self, token: Uuid, pipeline: PipelineKind) -> Result<Vec<StepNode>> {
        let nodes = self
            .store
            .insert_chain(token, pipeline.stages(), None, Utc::now())
            .await?;

        tracing::info!("🌱 Created {:?} run {} with {} steps", pipeline, token, nodes.len());
        Ok(nodes)
    }

    /// Create a run whose first step hangs off an existing step of another run
    ///
    /// Used for secondary pipelines (e.g. re-analysis) chained off a prior
    /// run, so failing the parent step also cancels the sub-run.
    pub async fn create_sub_run(
        &self,
        token: Uuid,
        parent: StepRef,
        pipeline: PipelineKind,
    ) -> Result<Vec<StepNode>> {
        let parent_node = self.require(parent.token, parent.step).await?;
        let nodes = self
            .store
            .insert_chain(token, pipeline.stages(), Some(parent_node.id), Utc::now())
            .await?;

        tracing::info!(
            "🌿 Created {:?} sub-run {} under {} with {} steps",
            pipeline,
            token,
            parent,
            nodes.len()
        );
        Ok(nodes)
    }

    /// PENDING -> IN_PROGRESS
    ///
    /// Returns the node unchanged when it is already IN_PROGRESS. A terminal
    /// node yields `InvalidTransition`, which callers treat as a signal to
    /// abandon redundant work.
    pub async fn start_step(&self, token: Uuid, step: StepKind) -> Result<StepNode> {
        let node = self.require(token, step).await?;
        match node.status {
            StepStatus::InProgress => return Ok(node),
            status if status.is_terminal() => {
                return Err(invalid(&node, StepStatus::InProgress));
            }
            _ => {}
        }

        let now = Utc::now();
        let (store, id) = (&self.store, node.id);
        match with_retry(&self.retry, "step start", move || {
            store.transition(id, StepStatus::Pending, StepStatus::InProgress, now, Some(now), None)
        })
        .await?
        {
            TransitionResult::Applied => {
                tracing::info!("▶️ Started step {} of run {}", step, token);
                self.require(token, step).await
            }
            TransitionResult::Conflict => {
                // Someone else moved it first; re-evaluate against the fresh state
                let fresh = self.require(token, step).await?;
                if fresh.status == StepStatus::InProgress {
                    Ok(fresh)
                } else {
                    Err(invalid(&fresh, StepStatus::InProgress))
                }
            }
        }
    }

    /// IN_PROGRESS -> COMPLETED, no cascade
    ///
    /// The guarded update is retried on transient storage errors; a retry
    /// after a lost commit acknowledgement surfaces as `InvalidTransition`.
    pub async fn complete_step(&self, token: Uuid, step: StepKind) -> Result<StepNode> {
        let node = self.require(token, step).await?;
        if node.status != StepStatus::InProgress {
            return Err(invalid(&node, StepStatus::Completed));
        }

        let (store, id) = (&self.store, node.id);
        match with_retry(&self.retry, "step completion", move || {
            store.transition(id, StepStatus::InProgress, StepStatus::Completed, Utc::now(), None, None)
        })
        .await?
        {
            TransitionResult::Applied => {
                tracing::info!("✅ Completed step {} of run {}", step, token);
                self.require(token, step).await
            }
            TransitionResult::Conflict => {
                let fresh = self.require(token, step).await?;
                Err(invalid(&fresh, StepStatus::Completed))
            }
        }
    }

    /// PENDING | IN_PROGRESS -> FAILED, cancelling every non-terminal descendant
    ///
    /// The node update and the cascade commit together or not at all, and the
    /// whole batch is retried on transient storage errors. A PENDING node gets
    /// `started_at` stamped with the failure time.
    pub async fn fail_step(&self, token: Uuid, step: StepKind, reason: &str) -> Result<CascadeOutcome> {
        let outcome = self.terminate(token, step, StepStatus::Failed, Some(reason)).await?;
        tracing::warn!(
            "💥 Failed step {} of run {} ({}), cancelled {} descendant(s)",
            step,
            token,
            reason,
            outcome.cancelled_descendants
        );
        Ok(outcome)
    }

    /// PENDING | IN_PROGRESS -> CANCELLED, cascading like [`fail_step`](Self::fail_step)
    pub async fn cancel_step(&self, token: Uuid, step: StepKind) -> Result<CascadeOutcome> {
        let outcome = self.terminate(token, step, StepStatus::Cancelled, None).await?;
        tracing::warn!(
            "🛑 Cancelled step {} of run {} and {} descendant(s)",
            step,
            token,
            outcome.cancelled_descendants
        );
        Ok(outcome)
    }

    async fn terminate(
        &self,
        token: Uuid,
        step: StepKind,
        to: StepStatus,
        reason: Option<&str>,
    ) -> Result<CascadeOutcome> {
        let node = self.require(token, step).await?;
        if !node.status.can_transition_to(to) {
            return Err(invalid(&node, to));
        }

        let now = Utc::now();
        let started_at = match node.status {
            StepStatus::Pending => Some(now),
            _ => None,
        };

        let store = &self.store;
        let (id, from) = (node.id, node.status);
        let cancelled = with_retry(&self.retry, "step cascade", move || {
            store.terminate_with_cascade(id, from, to, now, started_at, reason)
        })
        .await?;

        match cancelled {
            Some(cancelled_descendants) => Ok(CascadeOutcome {
                node: self.require(token, step).await?,
                cancelled_descendants,
            }),
            None => {
                let fresh = self.require(token, step).await?;
                Err(invalid(&fresh, to))
            }
        }
    }

    /// All nodes of a run in creation order (empty for an unknown token)
    pub async fn get_tree(&self, token: Uuid) -> Result<Vec<StepNode>> {
        self.store.find_by_token(token).await
    }

    pub async fn get_step(&self, token: Uuid, step: StepKind) -> Result<Option<StepNode>> {
        self.store.find(token, step).await
    }

    /// Direct successors of a step, including roots of sub-runs chained off it
    pub async fn children(&self, node: &StepNode) -> Result<Vec<StepNode>> {
        self.store.find_children(node.id).await
    }

    /// True iff some step of the run is still PENDING or IN_PROGRESS
    pub async fn is_run_in_progress(&self, token: Uuid) -> Result<bool> {
        self.store.any_active(token).await
    }

    /// Delete the whole step tree of a run once its outcome has been recorded elsewhere
    pub async fn reap_run(&self, token: Uuid) -> Result<u64> {
        let deleted = self.store.delete_by_token(token).await?;
        if deleted == 0 {
            return Err(Error::not_found(format!("run {token}")));
        }
        tracing::info!("🧹 Reaped {} step(s) of run {}", deleted, token);
        Ok(deleted)
    }

    async fn require(&self, token: Uuid, step: StepKind) -> Result<StepNode> {
        self.store
            .find(token, step)
            .await?
            .ok_or_else(|| Error::not_found(format!("step {step} of run {token}")))
    }
}

fn invalid(node: &StepNode, to: StepStatus) -> Error {
    Error::InvalidTransition {
        token: node.token,
        step: node.step.to_string(),
        from: node.status.to_string(),
        to: to.to_string(),
    }
}
