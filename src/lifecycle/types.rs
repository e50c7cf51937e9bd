// Core entity types for the test lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a single protocol execution.
///
/// Transitions are monotonic except for the explicit `Paused ↔ InProgress`
/// cycle; `Completed`, `Failed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    NotStarted,
    InProgress,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// An execution counts as active while work can still happen on it.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Aggregate status of a request, derived from its executions on demand.
/// Never stored, so it cannot desync from the execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single recorded measurement value. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// What was measured, e.g. "pmax" or "insulation_resistance"
    pub measurement_id: String,
    /// Optional test phase the value belongs to, e.g. "post_tc200"
    pub phase_id: Option<String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn new(measurement_id: impl Into<String>, value: f64) -> Self {
        Self {
            measurement_id: measurement_id.into(),
            phase_id: None,
            value,
            timestamp: Utc::now(),
        }
    }

    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = Some(phase_id.into());
        self
    }
}

/// Severity of a QC flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Warning,
    Error,
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("warning"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// A rule violation attached to an execution's flag log.
/// Generated by the evaluator, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcFlag {
    pub rule_id: String,
    pub flag_type: FlagType,
    pub description: String,
    pub value: f64,
    /// Human-readable rendering of the violated threshold
    pub threshold_repr: String,
    pub flagged_at: DateTime<Utc>,
}

/// Top-level entity for one sample's laboratory engagement.
///
/// Owns its inspections and protocol executions exclusively; removing a
/// request cascades to everything it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub sample_id: String,
    pub module_type: String,
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Incoming inspection of a sample. Completion is a boolean event, there
/// are no sub-states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inspection {
    pub inspection_id: String,
    pub request_id: String,
    /// What kind of inspection, e.g. "visual" or "el_imaging"
    pub kind: String,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One run of a qualification protocol against a sample. Accumulates the
/// measurement log and the QC flag log for that run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolExecution {
    pub execution_id: String,
    pub request_id: String,
    pub protocol_code: String,
    pub status: ExecutionStatus,
    pub measurements: Vec<Measurement>,
    pub flags: Vec<QcFlag>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProtocolExecution {
    /// Values recorded so far for one measurement id, in recording order.
    pub fn values_for(&self, measurement_id: &str) -> Vec<f64> {
        self.measurements
            .iter()
            .filter(|m| m.measurement_id == measurement_id)
            .map(|m| m.value)
            .collect()
    }

    pub fn warning_count(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| f.flag_type == FlagType::Warning)
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| f.flag_type == FlagType::Error)
            .count()
    }
}
