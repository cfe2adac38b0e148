/// Pipeline Coordination Layer
///
/// Connects step trees and fan-out phases:
/// - Event bus for step and phase transitions
/// - Coordinator that settles the owning step when a phase completes
/// - Cron-driven sweeper for phases that stopped receiving results

// Broadcast events published on every transition
pub mod events;

// Run submission, stage progression and phase completion handling
pub mod pipeline;

// Stale-phase detection on a cron schedule
pub mod sweeper;

pub use events::{EventBus, PipelineEvent};
pub use pipeline::{FanOut, PhaseCompletion, PhaseVerdict, PipelineCoordinator, ReportOutcome};
pub use sweeper::StalePhaseSweeper;
