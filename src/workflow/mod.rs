/// Step Tree Layer
///
/// This module tracks the per-run step tree and enforces its state machine:
/// - Type definitions (StepKind, PipelineKind, StepStatus, StepNode)
/// - SQLite persistence with guarded conditional updates
/// - Workflow engine with cascading failure and cancellation

// Core step tree type definitions
pub mod types;

// SQLite persistence layer for step nodes
pub mod storage;

// State machine operating over the step tree store
pub mod engine;

// Re-export commonly used types
pub use engine::{CascadeOutcome, WorkflowEngine};
pub use storage::StepTreeStore;
pub use types::{PipelineKind, StepKind, StepNode, StepRef, StepStatus};
