/// Scanflow: pipeline step tracking and scan completion aggregation
///
/// This library tracks each ingestion run as a tree of steps with cascading
/// failure, and counts the partial results of fan-out scan phases so that
/// exactly one caller observes a phase's completion.

// Core configuration and setup
pub mod config;

// Error type shared by every layer
pub mod error;

// SQLite pool, schema and retry policy
pub mod store;

// Step tree layer - per-run step chains and their state machine
pub mod workflow;

// Phase aggregation layer - race-free fan-in of partial scan results
pub mod scan;

// Coordination layer - events, phase completion handling, stale sweeps
pub mod coordinator;

// Service setup and initialization
pub mod service;

// Re-export commonly used types for external consumers
pub use config::Config;
pub use coordinator::{FanOut, PipelineCoordinator, PipelineEvent, ReportOutcome};
pub use error::{Error, Result};
pub use scan::{PartialResult, ScanRecord, ScanStatus, TargetType};
pub use service::{create_service, start_service};
pub use workflow::{PipelineKind, StepKind, StepNode, StepRef, StepStatus};
