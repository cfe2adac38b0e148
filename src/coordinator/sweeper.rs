/// Background stale-phase sweeper
///
/// Phases whose workers died never receive their last report. A cron job
/// (tokio-cron-scheduler) periodically looks for IN_PROGRESS phases that have
/// not been updated for a while and reports them, or fails them together with
/// their owning step. Closed phases whose owning step is still IN_PROGRESS
/// get that step settled.

use crate::{
    config::{StaleAction, SweeperConfig},
    coordinator::{
        events::PipelineEvent,
        pipeline::{tolerate_race, PipelineCoordinator},
    },
    scan::types::ScanRecord,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct StalePhaseSweeper {
    scheduler: Arc<RwLock<JobScheduler>>,
    coordinator: Arc<PipelineCoordinator>,
    config: SweeperConfig,
}

impl StalePhaseSweeper {
    pub async fn new(coordinator: Arc<PipelineCoordinator>, config: SweeperConfig) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            coordinator,
            config,
        })
    }

    /// Register the sweep job and start the scheduler
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting stale-phase sweeper ({})", self.config.schedule);

        let coordinator = Arc::clone(&self.coordinator);
        let config = self.config.clone();

        let job = Job::new_async(self.config.schedule.as_str(), move |_uuid, _l| {
            let coordinator = Arc::clone(&coordinator);
            let config = config.clone();

            Box::pin(async move {
                tracing::debug!("🔔 Stale-phase sweep triggered");
                match sweep(&coordinator, &config).await {
                    Ok(stale) if !stale.is_empty() => {
                        tracing::warn!("🕸️ Sweep found {} stale phase(s)", stale.len());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("❌ Stale-phase sweep failed: {}", e),
                }
            })
        })?;

        {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?;
            scheduler.start().await?;
        }

        tracing::info!("✅ Stale-phase sweeper started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping stale-phase sweeper");
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        tracing::info!("✅ Stale-phase sweeper stopped");
        Ok(())
    }

    /// Run one sweep now, outside the schedule
    pub async fn sweep_once(&self) -> Result<Vec<ScanRecord>> {
        sweep(&self.coordinator, &self.config).await
    }
}

/// Returns the phases found stale, as they were before any action was taken
///
/// One phase that cannot be acted on is logged and skipped; the rest of the
/// sweep still runs. Closed phases whose owning step never moved are settled
/// afterwards.
async fn sweep(coordinator: &PipelineCoordinator, config: &SweeperConfig) -> Result<Vec<ScanRecord>> {
    let stale = coordinator
        .aggregator()
        .stale_phases(config.stale_after())
        .await?;

    for record in &stale {
        tracing::warn!(
            "🕸️ Phase {} stale: {}/{} results, last update {}",
            record.token,
            record.received_results,
            record.expected_results,
            record.updated_at
        );
        coordinator.publish(PipelineEvent::PhaseStale {
            record: record.clone(),
        });

        if config.action == StaleAction::Fail {
            if let Err(e) = fail_stale(coordinator, record, config).await {
                tracing::error!("❌ Could not fail stale phase {}: {}", record.token, e);
            }
        }
    }

    settle_unsettled(coordinator, config).await?;
    Ok(stale)
}

async fn fail_stale(
    coordinator: &PipelineCoordinator,
    record: &ScanRecord,
    config: &SweeperConfig,
) -> Result<()> {
    if coordinator.aggregator().expire_phase(record.token).await?.is_none() {
        tracing::debug!("⏭️ Phase {} closed before it could be expired", record.token);
        return Ok(());
    }

    if let Some(owner) = record.owner {
        let reason = format!(
            "Phase {} timed out after {}s with {}/{} results received",
            record.token, config.stale_after_secs, record.received_results, record.expected_results
        );
        let aborted = coordinator
            .abort(owner.token, owner.step, &reason)
            .await
            .map(|_| ());
        tolerate_race(aborted, owner)?;
    }
    Ok(())
}

/// Settle owners left IN_PROGRESS behind a closed phase
async fn settle_unsettled(coordinator: &PipelineCoordinator, config: &SweeperConfig) -> Result<()> {
    let unsettled = coordinator
        .aggregator()
        .unsettled_phases(config.stale_after())
        .await?;

    for record in &unsettled {
        tracing::warn!(
            "🧹 Phase {} is {} but its owning step is still running",
            record.token,
            record.status
        );
        if let Err(e) = coordinator.settle_closed_phase(record).await {
            tracing::error!("❌ Could not settle owner of phase {}: {}", record.token, e);
        }
    }
    Ok(())
}
