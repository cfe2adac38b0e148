/// Scanflow demo runner
///
/// Starts the service, submits one standard run, fans the vulnerability
/// analysis out to a number of concurrent workers and drives the run to the
/// end once the single completion signal arrives.

use scanflow::{
    config::Config, service::start_service, FanOut, PartialResult, PipelineKind, ReportOutcome,
    StepKind, TargetType,
};
use std::sync::Arc;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::default();
    let workers: u32 = std::env::var("SCANFLOW_DEMO_WORKERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8);

    let service = start_service(config).await?;
    let coordinator = Arc::clone(&service.coordinator);

    // Log every event until the coordinator goes away
    let mut events = coordinator.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!("📣 {}", json),
                Err(e) => tracing::warn!("⚠️ Unserializable event: {}", e),
            }
        }
    });

    let token = Uuid::new_v4();
    coordinator.submit_run(token, PipelineKind::Standard).await?;
    coordinator.advance(token, StepKind::BomConsumption).await?;
    coordinator.start_stage(token, StepKind::BomProcessing).await?;
    coordinator.advance(token, StepKind::BomProcessing).await?;

    coordinator
        .begin_fan_out(FanOut {
            token,
            step: StepKind::VulnAnalysis,
            phase_token: None,
            target_type: TargetType::Project,
            target_identifier: Uuid::new_v4(),
            expected_results: workers,
            failure_threshold: None,
        })
        .await?;

    let mut handles = Vec::with_capacity(workers as usize);
    for worker in 0..workers {
        let coordinator = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move {
            coordinator
                .report_partial_result(PartialResult {
                    token,
                    result_count: 3,
                    failed_count: u32::from(worker == 0),
                    idempotency_key: format!("worker-{worker}"),
                })
                .await
        }));
    }

    let mut completions = 0;
    for handle in handles {
        if let ReportOutcome::Completed(completion) = handle.await?? {
            tracing::info!("🏁 Phase verdict: {:?}", completion.verdict);
            completions += 1;
        }
    }
    anyhow::ensure!(
        completions == 1,
        "expected exactly one completion signal, observed {completions}"
    );

    if coordinator.is_run_in_progress(token).await? {
        for step in [StepKind::PolicyEvaluation, StepKind::MetricsUpdate] {
            coordinator.start_stage(token, step).await?;
            coordinator.advance(token, step).await?;
        }
    }

    let tree = coordinator.get_run_status(token).await?;
    println!("{}", serde_json::to_string_pretty(&tree)?);

    service.sweeper.stop().await?;
    drop(service);
    drop(coordinator);
    listener.abort();

    Ok(())
}
