/// Pipeline coordinator
///
/// Glue between the workflow engine and the phase aggregator. It owns no
/// state of its own: everything it needs to react to a completed phase (the
/// owning step, the failure threshold) travels in the scan record.

use crate::config::{PhaseConfig, ThresholdPolicy};
use crate::coordinator::events::{EventBus, PipelineEvent};
use crate::error::{Error, Result};
use crate::scan::aggregator::PhaseAggregator;
use crate::scan::types::{NewPhase, PartialResult, ScanRecord, ScanStatus, TargetType};
use crate::workflow::engine::{CascadeOutcome, WorkflowEngine};
use crate::workflow::types::{PipelineKind, StepKind, StepNode, StepRef, StepStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// How a completed phase was judged against its failure threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PhaseVerdict {
    /// Failure ratio within the threshold
    Passed,
    /// Threshold exceeded, step completed anyway
    Degraded { failure_ratio: f64 },
    /// Threshold exceeded, step failed
    Failed { failure_ratio: f64, reason: String },
}

/// A phase that reached its expected result count
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCompletion {
    pub record: ScanRecord,
    pub verdict: PhaseVerdict,
    /// Set when the owning step could not be moved; the phase itself is
    /// closed and the sweeper settles the step later
    pub settle_error: Option<String>,
}

/// What happened to one worker report
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// Counted (or ignored as late); the phase is still open or was already closed
    Recorded,
    /// This report completed the phase
    Completed(PhaseCompletion),
}

/// Parameters for starting a fan-out step
#[derive(Debug, Clone)]
pub struct FanOut {
    /// Run token owning the step
    pub token: Uuid,
    pub step: StepKind,
    /// Phase correlation key; defaults to the run token
    pub phase_token: Option<Uuid>,
    pub target_type: TargetType,
    pub target_identifier: Uuid,
    pub expected_results: u32,
    /// Defaults to the configured threshold
    pub failure_threshold: Option<f64>,
}

/// Drives runs from trigger to completion
#[derive(Debug)]
pub struct PipelineCoordinator {
    engine: WorkflowEngine,
    aggregator: Arc<PhaseAggregator>,
    events: EventBus,
    phase: PhaseConfig,
}

impl PipelineCoordinator {
    pub fn new(
        engine: WorkflowEngine,
        aggregator: Arc<PhaseAggregator>,
        events: EventBus,
        phase: PhaseConfig,
    ) -> Self {
        Self {
            engine,
            aggregator,
            events,
            phase,
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn aggregator(&self) -> &PhaseAggregator {
        &self.aggregator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: PipelineEvent) {
        self.events.publish(event);
    }

    /// Accept a new run: materialize its step chain and start the first stage
    pub async fn submit_run(&self, token: Uuid, pipeline: PipelineKind) -> Result<Vec<StepNode>> {
        self.engine.create_run(token, pipeline).await?;
        self.events.publish(PipelineEvent::RunSubmitted { token, pipeline });

        self.start_stage(token, pipeline.first_stage()).await?;
        self.engine.get_tree(token).await
    }

    /// Accept a secondary run chained off `parent`
    ///
    /// Its first stage starts right away when the parent step has already
    /// completed; otherwise it stays PENDING and is announced as ready when
    /// the parent completes.
    pub async fn submit_sub_run(
        &self,
        token: Uuid,
        parent: StepRef,
        pipeline: PipelineKind,
    ) -> Result<Vec<StepNode>> {
        let nodes = self.engine.create_sub_run(token, parent, pipeline).await?;
        self.events.publish(PipelineEvent::RunSubmitted { token, pipeline });

        let parent_done = self
            .engine
            .get_step(parent.token, parent.step)
            .await?
            .map(|node| node.status == StepStatus::Completed)
            .unwrap_or(false);
        if parent_done {
            self.start_stage(token, pipeline.first_stage()).await?;
            return self.engine.get_tree(token).await;
        }

        Ok(nodes)
    }

    /// Start a stage that does not fan out
    pub async fn start_stage(&self, token: Uuid, step: StepKind) -> Result<StepNode> {
        let node = self.engine.start_step(token, step).await?;
        self.events.publish(PipelineEvent::StepStarted { token, step });
        Ok(node)
    }

    /// Complete a stage and announce its successors as ready
    pub async fn advance(&self, token: Uuid, step: StepKind) -> Result<Vec<StepRef>> {
        let node = self.engine.complete_step(token, step).await?;
        self.events.publish(PipelineEvent::StepCompleted { token, step });

        let ready: Vec<StepRef> = self
            .engine
            .children(&node)
            .await?
            .into_iter()
            .filter(|child| child.status == StepStatus::Pending)
            .map(|child| child.step_ref())
            .collect();

        for next in &ready {
            tracing::info!("➡️ Stage {} is ready", next);
            self.events.publish(PipelineEvent::StageReady {
                token: next.token,
                step: next.step,
            });
        }
        Ok(ready)
    }

    /// Fail a stage, cancelling everything downstream of it
    pub async fn abort(&self, token: Uuid, step: StepKind, reason: &str) -> Result<CascadeOutcome> {
        let outcome = self.engine.fail_step(token, step, reason).await?;
        self.events.publish(PipelineEvent::StepFailed {
            token,
            step,
            reason: reason.to_string(),
            cancelled_descendants: outcome.cancelled_descendants,
        });
        Ok(outcome)
    }

    /// Start a fan-out stage and begin tracking its phase
    ///
    /// A phase with nothing to wait for is finished immediately. Re-issuing
    /// the same fan-out returns the phase already tracked for the step; a
    /// phase that cannot begin fails the step it was started for.
    pub async fn begin_fan_out(&self, fan_out: FanOut) -> Result<ScanRecord> {
        let owner = StepRef::new(fan_out.token, fan_out.step);
        let phase = NewPhase {
            token: fan_out.phase_token.unwrap_or(fan_out.token),
            target_type: fan_out.target_type,
            target_identifier: fan_out.target_identifier,
            expected_results: fan_out.expected_results,
            failure_threshold: fan_out
                .failure_threshold
                .unwrap_or(self.phase.default_failure_threshold),
            owner: Some(owner),
        };
        if !(0.0..=1.0).contains(&phase.failure_threshold) {
            return Err(Error::invalid_input(format!(
                "failure threshold must be within [0, 1], got {}",
                phase.failure_threshold
            )));
        }

        self.start_stage(fan_out.token, fan_out.step).await?;

        let phase_token = phase.token;
        let record = match self.aggregator.begin_phase(phase).await {
            Ok(record) => record,
            Err(e) if e.is_duplicate_phase() => match self.aggregator.get_phase(phase_token).await? {
                Some(existing) if existing.owner == Some(owner) => {
                    tracing::debug!("🔁 Phase {} already tracked for {}", phase_token, owner);
                    return Ok(existing);
                }
                _ => return Err(self.fail_unbegun(owner, e).await),
            },
            Err(e) => return Err(self.fail_unbegun(owner, e).await),
        };

        if record.status.is_terminal() {
            self.finish_phase(record.clone()).await;
        }
        Ok(record)
    }

    /// Fail a step whose phase never began, handing back the original error
    async fn fail_unbegun(&self, owner: StepRef, error: Error) -> Error {
        let reason = format!("Phase could not begin: {}", error);
        let aborted = self.abort(owner.token, owner.step, &reason).await.map(|_| ());
        if let Err(e) = tolerate_race(aborted, owner) {
            tracing::error!("❌ Failed to fail step {} after {}: {}", owner, error, e);
        }
        error
    }

    /// Ingest one worker report; the report that completes the phase also
    /// settles the owning step
    pub async fn report_partial_result(&self, report: PartialResult) -> Result<ReportOutcome> {
        tracing::debug!(
            "📨 Report {} for phase {} ({} results, {} failed)",
            report.idempotency_key,
            report.token,
            report.result_count,
            report.failed_count
        );

        match self
            .aggregator
            .ingest_result(report.token, report.result_count, report.failed_count)
            .await?
        {
            Some(record) => Ok(ReportOutcome::Completed(self.finish_phase(record).await)),
            None => Ok(ReportOutcome::Recorded),
        }
    }

    /// Judge a completed phase and move its owning step accordingly
    ///
    /// The phase is already committed, so a step that cannot be moved is
    /// logged and reported in the completion rather than returned as an error.
    async fn finish_phase(&self, record: ScanRecord) -> PhaseCompletion {
        let verdict = self.evaluate(&record);
        self.events.publish(PipelineEvent::PhaseCompleted {
            record: record.clone(),
            verdict: verdict.clone(),
        });

        let settle_error = match self.settle_owner(&record, &verdict).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(
                    "❌ Phase {} completed but its owning step was not settled: {}",
                    record.token,
                    e
                );
                Some(e.to_string())
            }
        };

        PhaseCompletion {
            record,
            verdict,
            settle_error,
        }
    }

    async fn settle_owner(&self, record: &ScanRecord, verdict: &PhaseVerdict) -> Result<()> {
        let Some(owner) = record.owner else {
            return Ok(());
        };
        let settled = match verdict {
            PhaseVerdict::Failed { reason, .. } => {
                self.abort(owner.token, owner.step, reason).await.map(|_| ())
            }
            PhaseVerdict::Passed | PhaseVerdict::Degraded { .. } => {
                self.advance(owner.token, owner.step).await.map(|_| ())
            }
        };
        tolerate_race(settled, owner)
    }

    /// Settle the owner of a phase that closed while its step stayed IN_PROGRESS
    ///
    /// A COMPLETED phase is judged again; any other closed phase fails its owner.
    pub async fn settle_closed_phase(&self, record: &ScanRecord) -> Result<()> {
        match record.status {
            ScanStatus::Completed => {
                let verdict = self.evaluate(record);
                self.settle_owner(record, &verdict).await
            }
            ScanStatus::InProgress => Ok(()),
            status => {
                let reason = format!(
                    "Phase {} ended {} with {}/{} results received",
                    record.token, status, record.received_results, record.expected_results
                );
                self.settle_owner(
                    record,
                    &PhaseVerdict::Failed {
                        failure_ratio: record.failure_ratio(),
                        reason,
                    },
                )
                .await
            }
        }
    }

    /// Compare the failure ratio with the record's threshold
    pub fn evaluate(&self, record: &ScanRecord) -> PhaseVerdict {
        if !record.exceeds_failure_threshold() {
            return PhaseVerdict::Passed;
        }

        let failure_ratio = record.failure_ratio();
        match self.phase.threshold_policy {
            ThresholdPolicy::Degrade => PhaseVerdict::Degraded { failure_ratio },
            ThresholdPolicy::Fail => PhaseVerdict::Failed {
                failure_ratio,
                reason: format!(
                    "Failure threshold of {:.1}% exceeded: {}/{} of scans failed",
                    record.failure_threshold * 100.0,
                    record.scan_failed,
                    record.scan_total
                ),
            },
        }
    }

    pub async fn get_run_status(&self, token: Uuid) -> Result<Vec<StepNode>> {
        self.engine.get_tree(token).await
    }

    pub async fn get_phase_status(&self, token: Uuid) -> Result<Option<ScanRecord>> {
        self.aggregator.get_phase(token).await
    }

    pub async fn is_run_in_progress(&self, token: Uuid) -> Result<bool> {
        self.engine.is_run_in_progress(token).await
    }
}

/// Another caller already progressed (or reaped) this step; nothing left to do
pub(crate) fn tolerate_race(result: Result<()>, owner: StepRef) -> Result<()> {
    match result {
        Err(e) if e.is_invalid_transition() || e.is_not_found() => {
            tracing::warn!("⚠️ Step {} was already settled elsewhere: {}", owner, e);
            Ok(())
        }
        other => other,
    }
}
