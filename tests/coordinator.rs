use scanflow::config::{Config, StaleAction, ThresholdPolicy};
use scanflow::coordinator::{
    FanOut, PhaseVerdict, PipelineCoordinator, PipelineEvent, ReportOutcome, StalePhaseSweeper,
};
use scanflow::scan::{PartialResult, ScanStatus, TargetType};
use scanflow::service::build_coordinator;
use scanflow::store::Database;
use scanflow::workflow::{PipelineKind, StepKind, StepRef, StepStatus};
use scanflow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

fn config(policy: ThresholdPolicy) -> Config {
    let mut config = Config::default();
    config.retry.backoff_ms = 1;
    config.phase.threshold_policy = policy;
    config.phase.default_failure_threshold = 0.05;
    config.sweeper.stale_after_secs = 0;
    config
}

async fn coordinator(config: &Config) -> Arc<PipelineCoordinator> {
    coordinator_with_database(config).await.1
}

async fn coordinator_with_database(config: &Config) -> (Database, Arc<PipelineCoordinator>) {
    let database = Database::in_memory().await.unwrap();
    let coordinator = Arc::new(build_coordinator(&database, config));
    (database, coordinator)
}

/// Make every step-node update fail, as a storage outage would
async fn block_step_writes(database: &Database) {
    sqlx::query(
        "CREATE TRIGGER block_step_writes BEFORE UPDATE ON step_nodes \
         BEGIN SELECT RAISE(ABORT, 'step writes blocked'); END",
    )
    .execute(database.pool())
    .await
    .unwrap();
}

async fn unblock_step_writes(database: &Database) {
    sqlx::query("DROP TRIGGER block_step_writes")
        .execute(database.pool())
        .await
        .unwrap();
}

/// Submit a standard run and drive it up to the vulnerability analysis stage
async fn run_to_vuln_analysis(coordinator: &PipelineCoordinator) -> Uuid {
    let token = Uuid::new_v4();
    coordinator
        .submit_run(token, PipelineKind::Standard)
        .await
        .unwrap();
    coordinator
        .advance(token, StepKind::BomConsumption)
        .await
        .unwrap();
    coordinator
        .start_stage(token, StepKind::BomProcessing)
        .await
        .unwrap();
    coordinator
        .advance(token, StepKind::BomProcessing)
        .await
        .unwrap();
    token
}

fn fan_out(token: Uuid, expected: u32) -> FanOut {
    FanOut {
        token,
        step: StepKind::VulnAnalysis,
        phase_token: None,
        target_type: TargetType::Project,
        target_identifier: Uuid::new_v4(),
        expected_results: expected,
        failure_threshold: None,
    }
}

/// Submit a standard run and drive it up to the vulnerability analysis fan-out
async fn run_to_fan_out(coordinator: &PipelineCoordinator, expected: u32) -> Uuid {
    let token = run_to_vuln_analysis(coordinator).await;
    coordinator
        .begin_fan_out(fan_out(token, expected))
        .await
        .unwrap();
    token
}

fn report(token: Uuid, result_count: u32, failed_count: u32, key: &str) -> PartialResult {
    PartialResult {
        token,
        result_count,
        failed_count,
        idempotency_key: key.to_string(),
    }
}

fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn status_of(coordinator: &PipelineCoordinator, token: Uuid, step: StepKind) -> StepStatus {
    coordinator
        .engine()
        .get_step(token, step)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn submitted_run_starts_its_first_stage() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let mut rx = coordinator.subscribe();
    let token = Uuid::new_v4();

    let tree = coordinator
        .submit_run(token, PipelineKind::Standard)
        .await
        .unwrap();
    assert_eq!(tree[0].step, StepKind::BomConsumption);
    assert_eq!(tree[0].status, StepStatus::InProgress);
    assert!(tree[1..].iter().all(|n| n.status == StepStatus::Pending));

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![
            PipelineEvent::RunSubmitted {
                token,
                pipeline: PipelineKind::Standard
            },
            PipelineEvent::StepStarted {
                token,
                step: StepKind::BomConsumption
            },
        ]
    );
}

#[tokio::test]
async fn advancing_announces_the_next_stage() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let token = Uuid::new_v4();
    coordinator
        .submit_run(token, PipelineKind::Reanalysis)
        .await
        .unwrap();
    let mut rx = coordinator.subscribe();

    let ready = coordinator
        .advance(token, StepKind::VulnAnalysis)
        .await
        .unwrap();
    assert_eq!(ready, vec![StepRef::new(token, StepKind::PolicyEvaluation)]);
    assert!(drain(&mut rx).contains(&PipelineEvent::StageReady {
        token,
        step: StepKind::PolicyEvaluation
    }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reports_settle_the_owning_step_once() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let token = run_to_fan_out(&coordinator, 10).await;
    let mut rx = coordinator.subscribe();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .report_partial_result(report(token, 4, 0, &format!("worker-{i}")))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut completions = Vec::new();
    for handle in handles {
        if let ReportOutcome::Completed(completion) = handle.await.unwrap() {
            completions.push(completion);
        }
    }
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].verdict, PhaseVerdict::Passed);
    assert_eq!(completions[0].record.scan_total, 40);

    assert_eq!(
        status_of(&coordinator, token, StepKind::VulnAnalysis).await,
        StepStatus::Completed
    );
    assert_eq!(
        status_of(&coordinator, token, StepKind::PolicyEvaluation).await,
        StepStatus::Pending
    );

    let phase_events = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::PhaseCompleted { .. }))
        .count();
    assert_eq!(phase_events, 1);
}

#[tokio::test]
async fn exceeded_threshold_fails_the_step_under_fail_policy() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let token = run_to_fan_out(&coordinator, 2).await;

    coordinator
        .report_partial_result(report(token, 10, 0, "a"))
        .await
        .unwrap();
    let outcome = coordinator
        .report_partial_result(report(token, 10, 2, "b"))
        .await
        .unwrap();

    let ReportOutcome::Completed(completion) = outcome else {
        panic!("second report should complete the phase");
    };
    assert!(matches!(completion.verdict, PhaseVerdict::Failed { .. }));

    let node = coordinator
        .engine()
        .get_step(token, StepKind::VulnAnalysis)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, StepStatus::Failed);
    assert_eq!(
        node.failure_reason.as_deref(),
        Some("Failure threshold of 5.0% exceeded: 2/20 of scans failed")
    );
    assert_eq!(
        status_of(&coordinator, token, StepKind::MetricsUpdate).await,
        StepStatus::Cancelled
    );
    assert!(!coordinator.is_run_in_progress(token).await.unwrap());
}

#[tokio::test]
async fn exceeded_threshold_only_degrades_under_degrade_policy() {
    let coordinator = coordinator(&config(ThresholdPolicy::Degrade)).await;
    let token = run_to_fan_out(&coordinator, 1).await;

    let outcome = coordinator
        .report_partial_result(report(token, 4, 4, "only"))
        .await
        .unwrap();
    let ReportOutcome::Completed(completion) = outcome else {
        panic!("single report should complete the phase");
    };
    assert_eq!(
        completion.verdict,
        PhaseVerdict::Degraded { failure_ratio: 1.0 }
    );
    assert_eq!(
        status_of(&coordinator, token, StepKind::VulnAnalysis).await,
        StepStatus::Completed
    );
}

#[tokio::test]
async fn empty_fan_out_completes_immediately() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let token = run_to_fan_out(&coordinator, 0).await;

    let record = coordinator.get_phase_status(token).await.unwrap().unwrap();
    assert_eq!(record.status, ScanStatus::Completed);
    assert_eq!(
        status_of(&coordinator, token, StepKind::VulnAnalysis).await,
        StepStatus::Completed
    );
}

#[tokio::test]
async fn late_reports_after_completion_are_recorded_only() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let token = run_to_fan_out(&coordinator, 1).await;

    coordinator
        .report_partial_result(report(token, 1, 0, "first"))
        .await
        .unwrap();
    let late = coordinator
        .report_partial_result(report(token, 1, 0, "first"))
        .await
        .unwrap();
    assert_eq!(late, ReportOutcome::Recorded);
}

#[tokio::test]
async fn sub_run_waits_for_its_parent() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let run = Uuid::new_v4();
    let sub = Uuid::new_v4();
    coordinator
        .submit_run(run, PipelineKind::Standard)
        .await
        .unwrap();

    let tree = coordinator
        .submit_sub_run(
            sub,
            StepRef::new(run, StepKind::BomConsumption),
            PipelineKind::Reanalysis,
        )
        .await
        .unwrap();
    assert_eq!(tree[0].status, StepStatus::Pending);

    let ready = coordinator
        .advance(run, StepKind::BomConsumption)
        .await
        .unwrap();
    assert!(ready.contains(&StepRef::new(sub, StepKind::VulnAnalysis)));
    assert!(ready.contains(&StepRef::new(run, StepKind::BomProcessing)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweeper_reports_stale_phases_without_touching_them() {
    let config = config(ThresholdPolicy::Fail);
    let coordinator = coordinator(&config).await;
    let token = run_to_fan_out(&coordinator, 3).await;
    let mut rx = coordinator.subscribe();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sweeper = StalePhaseSweeper::new(Arc::clone(&coordinator), config.sweeper.clone())
        .await
        .unwrap();
    let stale = sweeper.sweep_once().await.unwrap();

    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].token, token);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, PipelineEvent::PhaseStale { record } if record.token == token)));
    assert_eq!(
        coordinator.get_phase_status(token).await.unwrap().unwrap().status,
        ScanStatus::InProgress
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweeper_fail_action_fails_phase_and_owner() {
    let mut config = config(ThresholdPolicy::Fail);
    config.sweeper.action = StaleAction::Fail;
    let coordinator = coordinator(&config).await;
    let token = run_to_fan_out(&coordinator, 3).await;
    coordinator
        .report_partial_result(report(token, 1, 0, "only-one"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sweeper = StalePhaseSweeper::new(Arc::clone(&coordinator), config.sweeper.clone())
        .await
        .unwrap();
    assert_eq!(sweeper.sweep_once().await.unwrap().len(), 1);

    assert_eq!(
        coordinator.get_phase_status(token).await.unwrap().unwrap().status,
        ScanStatus::Failed
    );
    assert_eq!(
        status_of(&coordinator, token, StepKind::VulnAnalysis).await,
        StepStatus::Failed
    );
    assert_eq!(
        status_of(&coordinator, token, StepKind::PolicyEvaluation).await,
        StepStatus::Cancelled
    );

    // Nothing is left to sweep once the phase is closed
    assert!(sweeper.sweep_once().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completion_survives_an_owner_that_cannot_be_settled() {
    let config = config(ThresholdPolicy::Fail);
    let (database, coordinator) = coordinator_with_database(&config).await;
    let token = run_to_fan_out(&coordinator, 2).await;
    coordinator
        .report_partial_result(report(token, 3, 0, "first"))
        .await
        .unwrap();

    block_step_writes(&database).await;
    let outcome = coordinator
        .report_partial_result(report(token, 3, 0, "second"))
        .await
        .unwrap();
    let ReportOutcome::Completed(completion) = outcome else {
        panic!("second report should complete the phase");
    };
    assert_eq!(completion.verdict, PhaseVerdict::Passed);
    assert_eq!(completion.record.status, ScanStatus::Completed);
    assert!(completion
        .settle_error
        .as_deref()
        .is_some_and(|e| e.contains("step writes blocked")));
    assert_eq!(
        status_of(&coordinator, token, StepKind::VulnAnalysis).await,
        StepStatus::InProgress
    );

    // A redelivered report does not reopen the phase
    let redelivered = coordinator
        .report_partial_result(report(token, 3, 0, "second"))
        .await
        .unwrap();
    assert_eq!(redelivered, ReportOutcome::Recorded);

    unblock_step_writes(&database).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let sweeper = StalePhaseSweeper::new(Arc::clone(&coordinator), config.sweeper.clone())
        .await
        .unwrap();
    assert!(sweeper.sweep_once().await.unwrap().is_empty());

    assert_eq!(
        status_of(&coordinator, token, StepKind::VulnAnalysis).await,
        StepStatus::Completed
    );
    assert_eq!(
        status_of(&coordinator, token, StepKind::PolicyEvaluation).await,
        StepStatus::Pending
    );
}

#[tokio::test]
async fn settled_completions_report_no_settle_error() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let token = run_to_fan_out(&coordinator, 1).await;

    let ReportOutcome::Completed(completion) = coordinator
        .report_partial_result(report(token, 1, 0, "only"))
        .await
        .unwrap()
    else {
        panic!("single report should complete the phase");
    };
    assert!(completion.settle_error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweeper_keeps_going_when_one_owner_cannot_be_failed() {
    let mut config = config(ThresholdPolicy::Fail);
    config.sweeper.action = StaleAction::Fail;
    let (database, coordinator) = coordinator_with_database(&config).await;
    let first = run_to_fan_out(&coordinator, 3).await;
    let second = run_to_fan_out(&coordinator, 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    block_step_writes(&database).await;
    let sweeper = StalePhaseSweeper::new(Arc::clone(&coordinator), config.sweeper.clone())
        .await
        .unwrap();
    assert_eq!(sweeper.sweep_once().await.unwrap().len(), 2);

    for token in [first, second] {
        assert_eq!(
            coordinator.get_phase_status(token).await.unwrap().unwrap().status,
            ScanStatus::Failed
        );
        assert_eq!(
            status_of(&coordinator, token, StepKind::VulnAnalysis).await,
            StepStatus::InProgress
        );
    }

    unblock_step_writes(&database).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sweeper.sweep_once().await.unwrap().is_empty());

    for token in [first, second] {
        let node = coordinator
            .engine()
            .get_step(token, StepKind::VulnAnalysis)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.status, StepStatus::Failed);
        assert!(node
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("ended FAILED")));
        assert_eq!(
            status_of(&coordinator, token, StepKind::PolicyEvaluation).await,
            StepStatus::Cancelled
        );
    }
}

#[tokio::test]
async fn out_of_range_threshold_leaves_the_step_pending() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let token = run_to_vuln_analysis(&coordinator).await;

    let mut bad = fan_out(token, 3);
    bad.failure_threshold = Some(1.5);
    let err = coordinator.begin_fan_out(bad).await.unwrap_err();

    assert!(matches!(err, Error::InvalidInput { .. }));
    assert_eq!(
        status_of(&coordinator, token, StepKind::VulnAnalysis).await,
        StepStatus::Pending
    );
    assert!(coordinator.get_phase_status(token).await.unwrap().is_none());
}

#[tokio::test]
async fn phase_token_taken_by_another_step_fails_the_new_step() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let first = run_to_fan_out(&coordinator, 3).await;
    let second = run_to_vuln_analysis(&coordinator).await;

    let mut clash = fan_out(second, 3);
    clash.phase_token = Some(first);
    let err = coordinator.begin_fan_out(clash).await.unwrap_err();
    assert!(matches!(err, Error::DuplicatePhase { token } if token == first));

    let node = coordinator
        .engine()
        .get_step(second, StepKind::VulnAnalysis)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, StepStatus::Failed);
    assert!(node
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.starts_with("Phase could not begin")));
    assert_eq!(
        status_of(&coordinator, second, StepKind::PolicyEvaluation).await,
        StepStatus::Cancelled
    );

    // The phase that was already there keeps its owner
    assert_eq!(
        status_of(&coordinator, first, StepKind::VulnAnalysis).await,
        StepStatus::InProgress
    );
}

#[tokio::test]
async fn reissued_fan_out_returns_the_tracked_phase() {
    let coordinator = coordinator(&config(ThresholdPolicy::Fail)).await;
    let token = run_to_fan_out(&coordinator, 3).await;
    coordinator
        .report_partial_result(report(token, 1, 0, "a"))
        .await
        .unwrap();

    let record = coordinator
        .begin_fan_out(fan_out(token, 3))
        .await
        .unwrap();
    assert_eq!(record.token, token);
    assert_eq!(record.received_results, 1);
    assert_eq!(record.status, ScanStatus::InProgress);
    assert_eq!(
        status_of(&coordinator, token, StepKind::VulnAnalysis).await,
        StepStatus::InProgress
    );
}
