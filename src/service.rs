/// Service setup and initialization
///
/// Wires together all components: database, step tree store, phase
/// aggregator, event bus, coordinator and the stale-phase sweeper.

use crate::{
    config::Config,
    coordinator::{EventBus, PipelineCoordinator, StalePhaseSweeper},
    scan::{PhaseAggregator, PhaseCache, ScanRecordStore},
    store::Database,
    workflow::{StepTreeStore, WorkflowEngine},
};
use anyhow::Result;
use std::sync::Arc;

/// A fully wired scanflow instance
pub struct Service {
    pub database: Database,
    pub coordinator: Arc<PipelineCoordinator>,
    pub sweeper: StalePhaseSweeper,
}

/// Build a coordinator over an already opened database
pub fn build_coordinator(database: &Database, config: &Config) -> PipelineCoordinator {
    let engine = WorkflowEngine::new(
        StepTreeStore::new(database.pool().clone()),
        config.retry.clone(),
    );
    let aggregator = Arc::new(PhaseAggregator::new(
        ScanRecordStore::new(database.pool().clone()),
        config.retry.clone(),
        PhaseCache::new(config.phase.cache_capacity, config.phase.cache_ttl()),
    ));
    let events = EventBus::new(config.phase.event_capacity);

PipelineCoordinator::new(engine, aggregator, events, config.phase.clone())
}

/// Open the database and wire every component, without starting background jobs
pub async fn create_service(config: Config) -> Result<Service> {
    tracing::info!("🏗️ Initializing scanflow database");
    let database = Database::connect(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    tracing::info!("🚀 Initializing pipeline coordinator");
    let coordinator = Arc::new(build_coordinator(&database, &config));

    tracing::info!("⏰ Initializing stale-phase sweeper");
    let sweeper = StalePhaseSweeper::new(Arc::clone(&coordinator), config.sweeper.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize sweeper: {}", e))?;

    tracing::info!("✅ Service initialized successfully");
    Ok(Service {
        database,
        coordinator,
        sweeper,
    })
}

/// Initialize logging, wire the service and start the sweeper
pub async fn start_service(config: Config) -> Result<Service> {
    let level: tracing::Level = config.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting scanflow...");

    let service = create_service(config).await?;
    service.sweeper.start().await?;

    Ok(service)
}
