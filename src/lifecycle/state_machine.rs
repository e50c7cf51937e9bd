//! Execution lifecycle state machine and request status derivation.
//!
//! `not_started → in_progress → {paused ↔ in_progress} → {completed | failed | aborted}`
//!
//! A rejected transition leaves the execution untouched; there is no partial
//! mutation. Request aggregate status is recomputed from the execution set on
//! every read instead of being stored alongside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::types::{ExecutionStatus, ProtocolExecution, RequestStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

/// Audit record of one applied transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    pub execution_id: String,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
    pub at: DateTime<Utc>,
}

/// Whether `from -> to` is part of the lifecycle.
///
/// Terminal states are only reachable from an active state, never straight
/// from `NotStarted`. Abort is additionally allowed out of `Paused` so a
/// stalled run does not have to be resumed just to be cancelled.
pub fn is_transition_allowed(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;
    matches!(
        (from, to),
        (NotStarted, InProgress)
            | (InProgress, Paused)
            | (Paused, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Aborted)
            | (Paused, Aborted)
    )
}

/// Apply a transition to an execution, stamping the start/finish times.
///
/// On rejection the execution is returned unchanged inside the error path;
/// no field is mutated before the transition has been validated.
pub fn apply_transition(
    execution: &mut ProtocolExecution,
    to: ExecutionStatus,
) -> Result<StateTransitionRecord, TransitionError> {
    let from = execution.status;
    if !is_transition_allowed(from, to) {
        return Err(TransitionError::InvalidTransition { from, to });
    }

    let now = Utc::now();
    execution.status = to;
    if from == ExecutionStatus::NotStarted {
        execution.started_at = Some(now);
    }
    if to.is_terminal() {
        execution.finished_at = Some(now);
    }

    let record = StateTransitionRecord {
        execution_id: execution.execution_id.clone(),
        from,
        to,
        at: now,
    };

    info!(
        execution_id = %record.execution_id,
        protocol = %execution.protocol_code,
        from = %from,
        to = %to,
        "Execution state transition"
    );

    Ok(record)
}

/// Derive the aggregate request status from its execution set.
///
/// A request with zero executions is `Pending`; it never counts as
/// completed.
pub fn derive_request_status(executions: &[ProtocolExecution]) -> RequestStatus {
    if executions.is_empty() {
        return RequestStatus::Pending;
    }
    if executions
        .iter()
        .all(|e| e.status == ExecutionStatus::Completed)
    {
        return RequestStatus::Completed;
    }
    if executions.iter().any(|e| e.status.is_active()) {
        return RequestStatus::InProgress;
    }
    if executions
        .iter()
        .any(|e| e.status == ExecutionStatus::Failed)
    {
        return RequestStatus::Failed;
    }
    RequestStatus::Pending
}

/// Percentage of executions completed; 0.0 for an empty set.
pub fn progress_percent(executions: &[ProtocolExecution]) -> f64 {
    if executions.is_empty() {
        return 0.0;
    }
    let completed = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Completed)
        .count();
    completed as f64 / executions.len() as f64 * 100.0
}
