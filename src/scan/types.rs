/// Scan record type definitions
///
/// A scan record tracks one fan-out phase: how many partial-result reports
/// are expected, how many have arrived, and the scanner totals they carried.

use crate::workflow::types::StepRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a fan-out phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    InProgress,
    /// Reached only through ingestion, exactly once
    Completed,
    /// Administrative override
    Failed,
    /// Administrative override
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown scan status: {other}")),
        }
    }
}

/// What a phase is scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    Project,
    Component,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "PROJECT",
            Self::Component => "COMPONENT",
        }
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROJECT" => Ok(Self::Project),
            "COMPONENT" => Ok(Self::Component),
            other => Err(format!("unknown target type: {other}")),
        }
    }
}

/// Persisted state of one fan-out phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Correlation key of the phase (the run token or a dedicated sub-token)
    pub token: Uuid,
    pub target_type: TargetType,
    pub target_identifier: Uuid,
    /// Step this phase belongs to, if it was started by the coordinator
    pub owner: Option<StepRef>,
    /// Number of reports that complete the phase, fixed at creation
    pub expected_results: u32,
    /// Incremented by exactly one per ingested report
    pub received_results: u32,
    /// Sum of scanner results carried by all reports; wider than a single
    /// report's count since it accumulates across reports
    pub scan_total: u64,
    /// Sum of failed scanner results carried by all reports
    pub scan_failed: u64,
    /// Fraction in [0, 1]; interpreted by the coordinator, never enforced here
    pub failure_threshold: f64,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanRecord {
    /// `scan_failed / scan_total`, or 0 when nothing was scanned
    pub fn failure_ratio(&self) -> f64 {
        if self.scan_total == 0 {
            0.0
        } else {
            self.scan_failed as f64 / self.scan_total as f64
        }
    }

    pub fn exceeds_failure_threshold(&self) -> bool {
        self.failure_ratio() > self.failure_threshold
    }
}

/// Parameters of a new fan-out phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPhase {
    pub token: Uuid,
    pub target_type: TargetType,
    pub target_identifier: Uuid,
    /// Fan-out cardinality; zero creates an already completed phase
    pub expected_results: u32,
    pub failure_threshold: f64,
    pub owner: Option<StepRef>,
}

/// One partial-result report from a worker
///
/// A single report may cover a batch of scanner results, so `result_count`
/// and `failed_count` can exceed one while the report itself counts once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialResult {
    /// Phase token the report belongs to
    pub token: Uuid,
    pub result_count: u32,
    pub failed_count: u32,
    /// Delivery-level deduplication key, checked by the message layer upstream
    pub idempotency_key: String,
}
