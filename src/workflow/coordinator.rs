//! Workflow coordination - composes the lifecycle state machine with the QC
//! evaluator over the collaborator boundaries.
//!
//! The coordinator owns the only shared mutable resource in the system:
//! per-execution state (status, measurement log, flag log). Every mutating
//! operation takes the execution's lock first, then performs request-level
//! reads, so sibling snapshots used for cascading completion are consistent.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{CoreError, CreatedEntity, EntityKind};
use super::traits::{RuleSource, StoreError, WorkflowStore};
use crate::lifecycle::state_machine::{
    apply_transition, derive_request_status, progress_percent, StateTransitionRecord,
};
use crate::lifecycle::types::{
    ExecutionStatus, Inspection, Measurement, ProtocolExecution, QcFlag, Request, RequestStatus,
};
use crate::qc::{evaluate, RuleSet};

/// Default cap on the history passed to the statistical rules. Keeps one
/// evaluation O(N) even for very long-running executions.
pub const DEFAULT_HISTORY_CAP: usize = 200;

/// Input for creating the request entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub sample_id: String,
    pub module_type: String,
    pub requested_by: Option<String>,
}

/// Input for creating the linked inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionInfo {
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: String,
    pub protocol_code: String,
}

/// Ids of everything a successful `create_workflow` produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub request_id: String,
    pub inspection_id: String,
    pub executions: Vec<ExecutionHandle>,
}

/// Result of an `advance` call, including the derived request status so a
/// caller can observe cascading completion.
#[derive(Debug, Clone)]
pub struct AdvanceOutcome {
    pub record: StateTransitionRecord,
    pub request_status: RequestStatus,
    pub request_completed: bool,
}

/// Read-only projection for the reporting collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub request_id: String,
    pub sample_id: String,
    pub module_type: String,
    pub status: RequestStatus,
    pub progress_percent: f64,
    pub inspection_completed: bool,
    pub executions: Vec<ExecutionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub protocol_code: String,
    pub status: ExecutionStatus,
    pub measurement_count: usize,
    pub warning_count: usize,
    pub error_count: usize,
}

pub struct WorkflowCoordinator {
    store: Arc<dyn WorkflowStore>,
    rules: Arc<dyn RuleSource>,
    history_cap: usize,
    // One lock per execution; record_measurement and advance both
    // read-then-write execution state.
    execution_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // Rule sets are immutable per protocol, loaded once and shared.
    rule_sets: RwLock<HashMap<String, Arc<RuleSet>>>,
}

impl WorkflowCoordinator {
    pub fn new(store: Arc<dyn WorkflowStore>, rules: Arc<dyn RuleSource>) -> Self {
        Self {
            store,
            rules,
            history_cap: DEFAULT_HISTORY_CAP,
            execution_locks: Mutex::new(HashMap::new()),
            rule_sets: RwLock::new(HashMap::new()),
        }
    }

    /// Cap on the per-measurement history considered by the statistical
    /// rules; 0 means unbounded.
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    /// Create one request, one linked inspection and one not-started
    /// execution per protocol code.
    ///
    /// On partial failure the entities created so far are reported and left
    /// in place; compensation belongs to the persistence collaborator's
    /// transaction boundary, not to this coordinator.
    pub async fn create_workflow(
        &self,
        request_info: RequestInfo,
        inspection_info: InspectionInfo,
        protocol_codes: &[String],
    ) -> Result<WorkflowHandle, CoreError> {
        if request_info.sample_id.trim().is_empty() {
            return Err(CoreError::Validation("sample_id must not be empty".into()));
        }
        if protocol_codes.is_empty() {
            return Err(CoreError::Validation(
                "a request needs at least one protocol".into(),
            ));
        }

        let mut created: Vec<CreatedEntity> = Vec::new();

        let request = Request {
            request_id: Uuid::new_v4().to_string(),
            sample_id: request_info.sample_id,
            module_type: request_info.module_type,
            requested_by: request_info.requested_by,
            created_at: Utc::now(),
        };
        let request_id = request.request_id.clone();
        self.store
            .insert_request(request)
            .await
            .map_err(|e| partial(&created, e))?;
        created.push(CreatedEntity {
            kind: EntityKind::Request,
            id: request_id.clone(),
        });

        let inspection = Inspection {
            inspection_id: Uuid::new_v4().to_string(),
            request_id: request_id.clone(),
            kind: inspection_info.kind,
            completed: false,
            completed_at: None,
            created_at: Utc::now(),
        };
        let inspection_id = inspection.inspection_id.clone();
        self.store
            .insert_inspection(inspection)
            .await
            .map_err(|e| partial(&created, e))?;
        created.push(CreatedEntity {
            kind: EntityKind::Inspection,
            id: inspection_id.clone(),
        });

        let mut executions = Vec::with_capacity(protocol_codes.len());
        for code in protocol_codes {
            // Resolving the rule set up front surfaces unknown protocols at
            // creation time instead of at the first measurement.
            self.rule_set_for(code)
                .await
                .map_err(|e| partial_from_core(&created, e))?;

            let execution = ProtocolExecution {
                execution_id: Uuid::new_v4().to_string(),
                request_id: request_id.clone(),
                protocol_code: code.clone(),
                status: ExecutionStatus::NotStarted,
                measurements: Vec::new(),
                flags: Vec::new(),
                started_at: None,
                finished_at: None,
                created_at: Utc::now(),
            };
            let handle = ExecutionHandle {
                execution_id: execution.execution_id.clone(),
                protocol_code: code.clone(),
            };
            self.store
                .insert_execution(execution)
                .await
                .map_err(|e| partial(&created, e))?;
            created.push(CreatedEntity {
                kind: EntityKind::Execution,
                id: handle.execution_id.clone(),
            });
            executions.push(handle);
        }

        info!(
            request_id = %request_id,
            protocols = protocol_codes.len(),
            "Created workflow"
        );

        Ok(WorkflowHandle {
            request_id,
            inspection_id,
            executions,
        })
    }

    /// Append a measurement to an execution's log, evaluate it against the
    /// protocol's rule set and the execution's history for the same
    /// measurement id, append the resulting flags and return them.
    ///
    /// An error-severity flag does not transition the execution's state;
    /// state changes are always an explicit `advance`.
    pub async fn record_measurement(
        &self,
        execution_id: &str,
        measurement: Measurement,
    ) -> Result<Vec<QcFlag>, CoreError> {
        if measurement.measurement_id.trim().is_empty() {
            warn!(execution_id, "Rejecting measurement without measurement_id");
            return Err(CoreError::Validation(
                "measurement_id must not be empty".into(),
            ));
        }
        if !measurement.value.is_finite() {
            warn!(
                execution_id,
                measurement_id = %measurement.measurement_id,
                "Rejecting non-finite measurement value"
            );
            return Err(CoreError::Validation(format!(
                "measurement value {} is not finite",
                measurement.value
            )));
        }

        let lock = self.execution_lock(execution_id).await;
        let _guard = lock.lock().await;

        let mut execution = self.fetch_execution(execution_id).await?;
        let rule_set = self.rule_set_for(&execution.protocol_code).await?;

        execution.measurements.push(measurement.clone());
        let history = execution.values_for(&measurement.measurement_id);
        let history = cap_history(&history, self.history_cap);

        let flags = evaluate(&measurement, &rule_set, history);
        if !flags.is_empty() {
            info!(
                execution_id,
                measurement_id = %measurement.measurement_id,
                value = measurement.value,
                flags = flags.len(),
                "Measurement flagged by QC rules"
            );
        }
        execution.flags.extend(flags.iter().cloned());
        self.store.update_execution(execution).await?;

        Ok(flags)
    }

    /// Apply a lifecycle transition to an execution.
    ///
    /// Completing the last sibling under a request cascades the request
    /// itself to completed, observable through the derived status.
    pub async fn advance(
        &self,
        execution_id: &str,
        new_status: ExecutionStatus,
    ) -> Result<AdvanceOutcome, CoreError> {
        let lock = self.execution_lock(execution_id).await;
        let _guard = lock.lock().await;

        let mut execution = self.fetch_execution(execution_id).await?;
        let request_id = execution.request_id.clone();

        let record = apply_transition(&mut execution, new_status)?;
        self.store.update_execution(execution).await?;

        // Request-level read happens under the execution lock so the
        // sibling snapshot is consistent with the write above.
        let siblings = self.store.list_executions(&request_id).await?;
        let request_status = derive_request_status(&siblings);
        let request_completed =
            new_status == ExecutionStatus::Completed && request_status == RequestStatus::Completed;
        if request_completed {
            info!(
                request_id = %request_id,
                "All protocol executions completed; request completed"
            );
        }

        Ok(AdvanceOutcome {
            record,
            request_status,
            request_completed,
        })
    }

    /// Mark the earliest pending inspection of a request completed.
    pub async fn record_inspection(&self, request_id: &str) -> Result<Inspection, CoreError> {
        self.fetch_request(request_id).await?;
        let inspections = self.store.list_inspections(request_id).await?;
        let mut pending = inspections
            .into_iter()
            .find(|i| !i.completed)
            .ok_or_else(|| {
                CoreError::Validation(format!("no pending inspection for request {request_id}"))
            })?;
        pending.completed = true;
        pending.completed_at = Some(Utc::now());
        self.store.update_inspection(pending.clone()).await?;
        info!(request_id, inspection_id = %pending.inspection_id, "Inspection completed");
        Ok(pending)
    }

    /// Pending operator actions, derived purely from current state.
    pub async fn next_actions(&self, request_id: &str) -> Result<Vec<String>, CoreError> {
        let _request = self.fetch_request(request_id).await?;
        let inspections = self.store.list_inspections(request_id).await?;
        let executions = self.store.list_executions(request_id).await?;
        let status = derive_request_status(&executions);

        let mut actions = Vec::new();
        if status == RequestStatus::Pending {
            actions.push("Approve request and begin protocol testing".to_string());
        }
        if !inspections.iter().any(|i| i.completed) {
            actions.push("Complete the incoming inspection".to_string());
        }
        for execution in &executions {
            match execution.status {
                ExecutionStatus::NotStarted => {
                    actions.push(format!("Start protocol {}", execution.protocol_code));
                }
                ExecutionStatus::Paused => {
                    actions.push(format!("Resume protocol {}", execution.protocol_code));
                }
                ExecutionStatus::InProgress => {
                    actions.push(format!(
                        "Record measurements and finish protocol {}",
                        execution.protocol_code
                    ));
                }
                _ => {}
            }
        }
        if status == RequestStatus::Completed {
            actions.push("Generate the final qualification report".to_string());
        }
        Ok(actions)
    }

    /// Read-only workflow status for the reporting collaborator.
    pub async fn get_workflow_status(&self, request_id: &str) -> Result<WorkflowStatus, CoreError> {
        let request = self.fetch_request(request_id).await?;
        let inspections = self.store.list_inspections(request_id).await?;
        let executions = self.store.list_executions(request_id).await?;

        Ok(WorkflowStatus {
            request_id: request.request_id,
            sample_id: request.sample_id,
            module_type: request.module_type,
            status: derive_request_status(&executions),
            progress_percent: progress_percent(&executions),
            inspection_completed: inspections.iter().any(|i| i.completed),
            executions: executions
                .iter()
                .map(|e| ExecutionSummary {
                    execution_id: e.execution_id.clone(),
                    protocol_code: e.protocol_code.clone(),
                    status: e.status,
                    measurement_count: e.measurements.len(),
                    warning_count: e.warning_count(),
                    error_count: e.error_count(),
                })
                .collect(),
        })
    }

    /// Read-only flag log of one execution.
    pub async fn get_execution_flags(&self, execution_id: &str) -> Result<Vec<QcFlag>, CoreError> {
        let execution = self.fetch_execution(execution_id).await?;
        Ok(execution.flags)
    }

    async fn fetch_request(&self, request_id: &str) -> Result<Request, CoreError> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                kind: EntityKind::Request,
                id: request_id.to_string(),
            })
    }

    async fn fetch_execution(&self, execution_id: &str) -> Result<ProtocolExecution, CoreError> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                kind: EntityKind::Execution,
                id: execution_id.to_string(),
            })
    }

    async fn execution_lock(&self, execution_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.execution_locks.lock().await;
        locks
            .entry(execution_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn rule_set_for(&self, protocol_code: &str) -> Result<Arc<RuleSet>, CoreError> {
        if let Some(rule_set) = self.rule_sets.read().await.get(protocol_code) {
            return Ok(rule_set.clone());
        }
        let loaded = self
            .rules
            .load_rule_set(protocol_code)
            .await
            .map_err(|e| match e {
                StoreError::UnknownId(id) => CoreError::NotFound {
                    kind: EntityKind::Protocol,
                    id,
                },
                other => other.into(),
            })?;
        let rule_set = Arc::new(loaded);
        self.rule_sets
            .write()
            .await
            .insert(protocol_code.to_string(), rule_set.clone());
        Ok(rule_set)
    }
}

fn cap_history(values: &[f64], cap: usize) -> &[f64] {
    if cap == 0 || values.len() <= cap {
        values
    } else {
        &values[values.len() - cap..]
    }
}

fn partial(created: &[CreatedEntity], error: StoreError) -> CoreError {
    CoreError::PartialCreation {
        created: created.to_vec(),
        reason: error.to_string(),
    }
}

fn partial_from_core(created: &[CreatedEntity], error: CoreError) -> CoreError {
    CoreError::PartialCreation {
        created: created.to_vec(),
        reason: error.to_string(),
    }
}
