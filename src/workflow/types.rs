/// Step tree type definitions
///
/// A run is a fixed, ordered sequence of stages chosen by its pipeline kind.
/// Each stage is persisted as one [`StepNode`], parented by the node of the
/// previous stage, and moves through the [`StepStatus`] state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stages a pipeline run can pass through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// Accepting the uploaded document
    BomConsumption,
    /// Turning the document into components
    BomProcessing,
    /// Fan-out to vulnerability scanners
    VulnAnalysis,
    PolicyEvaluation,
    MetricsUpdate,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BomConsumption => "BOM_CONSUMPTION",
            Self::BomProcessing => "BOM_PROCESSING",
            Self::VulnAnalysis => "VULN_ANALYSIS",
            Self::PolicyEvaluation => "POLICY_EVALUATION",
            Self::MetricsUpdate => "METRICS_UPDATE",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BOM_CONSUMPTION" => Ok(Self::BomConsumption),
            "BOM_PROCESSING" => Ok(Self::BomProcessing),
            "VULN_ANALYSIS" => Ok(Self::VulnAnalysis),
            "POLICY_EVALUATION" => Ok(Self::PolicyEvaluation),
            "METRICS_UPDATE" => Ok(Self::MetricsUpdate),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Pipeline kinds and their fixed stage sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineKind {
    /// Full processing of an uploaded BOM
    Standard,
    /// Re-analysis of an already processed project
    Reanalysis,
}

impl PipelineKind {
    /// Stages in execution order; each stage's node is parented by the one before it
    pub fn stages(&self) -> &'static [StepKind] {
        match self {
            Self::Standard => &[
                StepKind::BomConsumption,
                StepKind::BomProcessing,
                StepKind::VulnAnalysis,
                StepKind::PolicyEvaluation,
                StepKind::MetricsUpdate,
            ],
            Self::Reanalysis => &[StepKind::VulnAnalysis, StepKind::PolicyEvaluation],
        }
    }

    pub fn first_stage(&self) -> StepKind {
        self.stages()[0]
    }
}

/// Lifecycle of a single step node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal forward moves of the step state machine
    ///
    /// CANCELLED is only ever applied by a cascade from a failed or cancelled
    /// ancestor, or by an administrative cancel.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Address of one step within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepRef {
    pub token: Uuid,
    pub step: StepKind,
}

impl StepRef {
    pub fn new(token: Uuid, step: StepKind) -> Self {
        Self { token, step }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.token, self.step)
    }
}

/// Persisted state of one stage of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    /// Row identity, stable for the node's lifetime
    pub id: i64,
    /// Owning run
    pub token: Uuid,
    pub step: StepKind,
    /// Node of the previous stage; `None` for the root of a standalone run
    pub parent_id: Option<i64>,
    pub status: StepStatus,
    /// Set on the transition into IN_PROGRESS
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Only set on FAILED nodes; cancelled descendants inherit the ancestor's reason
    pub failure_reason: Option<String>,
}

impl StepNode {
    pub fn step_ref(&self) -> StepRef {
        StepRef::new(self.token, self.step)
    }
}
