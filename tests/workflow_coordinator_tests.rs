//! Integration tests for the workflow coordinator.
//!
//! Drives the public surface end to end: workflow creation (including the
//! documented partial-failure behavior), measurement recording with QC
//! evaluation, lifecycle transitions with cascading request completion, and
//! the derived projections.

use std::sync::Arc;

use async_trait::async_trait;

use pvlab::workflow::traits::{StoreError, WorkflowStore};
use pvlab::{
    CoreError, EntityKind, ExecutionStatus, InMemoryStore, Inspection, InspectionInfo,
    Measurement, ProtocolExecution, ProtocolRegistry, Request, RequestInfo, RequestStatus,
    WorkflowCoordinator,
};

fn request_info(sample: &str) -> RequestInfo {
    RequestInfo {
        sample_id: sample.to_string(),
        module_type: "mono-perc-400".to_string(),
        requested_by: Some("qa-operator".to_string()),
    }
}

fn inspection_info() -> InspectionInfo {
    InspectionInfo {
        kind: "visual".to_string(),
    }
}

fn protocols(codes: &[&str]) -> Vec<String> {
    codes.iter().map(|c| c.to_string()).collect()
}

fn coordinator_with_store() -> (WorkflowCoordinator, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(ProtocolRegistry::with_builtin());
    let coordinator = WorkflowCoordinator::new(store.clone(), registry);
    (coordinator, store)
}

#[tokio::test]
async fn create_workflow_creates_one_request_one_inspection_three_executions() {
    let (coordinator, _store) = coordinator_with_store();

    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0117"),
            inspection_info(),
            &protocols(&["TC200", "DH1000", "UV15"]),
        )
        .await
        .expect("creation should succeed");

    assert_eq!(handle.executions.len(), 3);

    let status = coordinator
        .get_workflow_status(&handle.request_id)
        .await
        .unwrap();
    assert_eq!(status.status, RequestStatus::Pending);
    assert_eq!(status.progress_percent, 0.0);
    assert!(!status.inspection_completed);
    assert_eq!(status.executions.len(), 3);
    for execution in &status.executions {
        assert_eq!(execution.status, ExecutionStatus::NotStarted);
    }
}

#[tokio::test]
async fn create_workflow_with_unknown_protocol_surfaces_partial_creation() {
    let (coordinator, store) = coordinator_with_store();

    let result = coordinator
        .create_workflow(
            request_info("PV-2024-0118"),
            inspection_info(),
            &protocols(&["TC200", "NO_SUCH_PROTOCOL"]),
        )
        .await;

    let (created, reason) = match result {
        Err(CoreError::PartialCreation { created, reason }) => (created, reason),
        other => panic!("expected PartialCreation, got {other:?}"),
    };
    assert!(reason.contains("NO_SUCH_PROTOCOL"));
    // Request, inspection and the TC200 execution were created before the
    // failure and are intentionally left in place.
    assert_eq!(created.len(), 3);
    assert_eq!(created[0].kind, EntityKind::Request);
    assert_eq!(created[1].kind, EntityKind::Inspection);
    assert_eq!(created[2].kind, EntityKind::Execution);

    let request = store.get_request(&created[0].id).await.unwrap();
    assert!(request.is_some(), "partial entities are not rolled back");
}

#[tokio::test]
async fn create_workflow_requires_at_least_one_protocol() {
    let (coordinator, _store) = coordinator_with_store();
    let result = coordinator
        .create_workflow(request_info("PV-2024-0119"), inspection_info(), &[])
        .await;
    assert!(matches!(result, Err(CoreError::Validation(_))));
}

#[tokio::test]
async fn outlier_flag_appears_only_once_history_is_sufficient() {
    let (coordinator, _store) = coordinator_with_store();
    // TC200 carries an IQR outlier rule scoped to "pmax"
    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0120"),
            inspection_info(),
            &protocols(&["TC200"]),
        )
        .await
        .unwrap();
    let execution_id = &handle.executions[0].execution_id;

    for value in [392.0, 393.5, 392.8, 393.1] {
        let flags = coordinator
            .record_measurement(execution_id, Measurement::new("pmax", value))
            .await
            .unwrap();
        assert!(
            flags.is_empty(),
            "low-variance series should not flag at value {value}"
        );
    }

    let flags = coordinator
        .record_measurement(execution_id, Measurement::new("pmax", 310.0))
        .await
        .unwrap();
    assert_eq!(flags.len(), 1, "the extreme 5th value should flag");
    assert_eq!(flags[0].rule_id, "tc200-pmax-outlier");

    let log = coordinator.get_execution_flags(execution_id).await.unwrap();
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn error_flag_does_not_transition_execution_state() {
    let (coordinator, _store) = coordinator_with_store();
    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0121"),
            inspection_info(),
            &protocols(&["TC200"]),
        )
        .await
        .unwrap();
    let execution_id = &handle.executions[0].execution_id;

    coordinator
        .advance(execution_id, ExecutionStatus::InProgress)
        .await
        .unwrap();

    // pmax_ratio below the 0.95 floor fires the flag_error range rule
    let flags = coordinator
        .record_measurement(execution_id, Measurement::new("pmax_ratio", 0.82))
        .await
        .unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].rule_id, "tc200-pmax-ratio");

    let status = coordinator
        .get_workflow_status(&handle.request_id)
        .await
        .unwrap();
    assert_eq!(
        status.executions[0].status,
        ExecutionStatus::InProgress,
        "state transitions are always an explicit operation"
    );
    assert_eq!(status.executions[0].error_count, 1);
}

#[tokio::test]
async fn invalid_transition_is_rejected_and_state_unchanged() {
    let (coordinator, _store) = coordinator_with_store();
    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0122"),
            inspection_info(),
            &protocols(&["TC200"]),
        )
        .await
        .unwrap();
    let execution_id = &handle.executions[0].execution_id;

    let result = coordinator
        .advance(execution_id, ExecutionStatus::Completed)
        .await;
    assert!(matches!(result, Err(CoreError::Transition(_))));

    let status = coordinator
        .get_workflow_status(&handle.request_id)
        .await
        .unwrap();
    assert_eq!(status.executions[0].status, ExecutionStatus::NotStarted);

    // The two-step path works
    coordinator
        .advance(execution_id, ExecutionStatus::InProgress)
        .await
        .unwrap();
    let outcome = coordinator
        .advance(execution_id, ExecutionStatus::Completed)
        .await
        .unwrap();
    assert!(outcome.request_completed);
}

#[tokio::test]
async fn cascading_completion_fires_only_on_the_last_sibling() {
    let (coordinator, _store) = coordinator_with_store();
    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0123"),
            inspection_info(),
            &protocols(&["TC200", "DH1000"]),
        )
        .await
        .unwrap();
    let first = &handle.executions[0].execution_id;
    let second = &handle.executions[1].execution_id;

    for id in [first, second] {
        coordinator
            .advance(id, ExecutionStatus::InProgress)
            .await
            .unwrap();
    }

    let outcome = coordinator
        .advance(first, ExecutionStatus::Completed)
        .await
        .unwrap();
    assert!(!outcome.request_completed);
    assert_eq!(outcome.request_status, RequestStatus::InProgress);

    let outcome = coordinator
        .advance(second, ExecutionStatus::Completed)
        .await
        .unwrap();
    assert!(outcome.request_completed);
    assert_eq!(outcome.request_status, RequestStatus::Completed);

    let status = coordinator
        .get_workflow_status(&handle.request_id)
        .await
        .unwrap();
    assert_eq!(status.status, RequestStatus::Completed);
    assert_eq!(status.progress_percent, 100.0);
}

#[tokio::test]
async fn progress_is_exact_for_two_of_four_executions() {
    let (coordinator, _store) = coordinator_with_store();
    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0124"),
            inspection_info(),
            &protocols(&["TC200", "DH1000", "UV15", "ML2400"]),
        )
        .await
        .unwrap();

    for execution in handle.executions.iter().take(2) {
        coordinator
            .advance(&execution.execution_id, ExecutionStatus::InProgress)
            .await
            .unwrap();
        coordinator
            .advance(&execution.execution_id, ExecutionStatus::Completed)
            .await
            .unwrap();
    }

    let status = coordinator
        .get_workflow_status(&handle.request_id)
        .await
        .unwrap();
    assert_eq!(status.progress_percent, 50.0);
}

#[tokio::test]
async fn next_actions_track_the_workflow() {
    let (coordinator, _store) = coordinator_with_store();
    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0125"),
            inspection_info(),
            &protocols(&["TC200"]),
        )
        .await
        .unwrap();
    let execution_id = &handle.executions[0].execution_id;

    let actions = coordinator.next_actions(&handle.request_id).await.unwrap();
    assert!(actions.iter().any(|a| a.contains("Approve request")));
    assert!(actions.iter().any(|a| a.contains("incoming inspection")));
    assert!(actions.iter().any(|a| a.contains("Start protocol TC200")));

    coordinator.record_inspection(&handle.request_id).await.unwrap();
    coordinator
        .advance(execution_id, ExecutionStatus::InProgress)
        .await
        .unwrap();

    let actions = coordinator.next_actions(&handle.request_id).await.unwrap();
    assert!(!actions.iter().any(|a| a.contains("inspection")));
    assert!(actions.iter().any(|a| a.contains("finish protocol TC200")));

    coordinator
        .advance(execution_id, ExecutionStatus::Completed)
        .await
        .unwrap();
    let actions = coordinator.next_actions(&handle.request_id).await.unwrap();
    assert!(actions.iter().any(|a| a.contains("final qualification report")));
}

#[tokio::test]
async fn unknown_ids_surface_not_found() {
    let (coordinator, _store) = coordinator_with_store();

    let result = coordinator
        .record_measurement("ghost", Measurement::new("pmax", 1.0))
        .await;
    assert!(matches!(
        result,
        Err(CoreError::NotFound {
            kind: EntityKind::Execution,
            ..
        })
    ));

    let result = coordinator.next_actions("ghost").await;
    assert!(matches!(
        result,
        Err(CoreError::NotFound {
            kind: EntityKind::Request,
            ..
        })
    ));
}

#[tokio::test]
async fn non_finite_measurement_values_are_rejected() {
    let (coordinator, _store) = coordinator_with_store();
    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0126"),
            inspection_info(),
            &protocols(&["TC200"]),
        )
        .await
        .unwrap();
    let execution_id = &handle.executions[0].execution_id;

    for bad in [f64::NAN, f64::INFINITY] {
        let result = coordinator
            .record_measurement(execution_id, Measurement::new("pmax", bad))
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    let status = coordinator
        .get_workflow_status(&handle.request_id)
        .await
        .unwrap();
    assert_eq!(
        status.executions[0].measurement_count, 0,
        "rejected measurements must not be recorded"
    );
}

#[tokio::test]
async fn snapshot_survives_a_coordinator_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let store = Arc::new(InMemoryStore::new());
    let coordinator =
        WorkflowCoordinator::new(store.clone(), Arc::new(ProtocolRegistry::with_builtin()));
    let handle = coordinator
        .create_workflow(
            request_info("PV-2024-0127"),
            inspection_info(),
            &protocols(&["TC200"]),
        )
        .await
        .unwrap();
    coordinator
        .record_measurement(
            &handle.executions[0].execution_id,
            Measurement::new("pmax", 393.0),
        )
        .await
        .unwrap();
    store.save_to_path(&path).await.unwrap();

    let restored = Arc::new(InMemoryStore::load_from_path(&path).await.unwrap());
    let coordinator =
        WorkflowCoordinator::new(restored, Arc::new(ProtocolRegistry::with_builtin()));
    let status = coordinator
        .get_workflow_status(&handle.request_id)
        .await
        .unwrap();
    assert_eq!(status.executions[0].measurement_count, 1);
}

/// Store that accepts requests and inspections but refuses executions, to
/// exercise the partial-creation path on a persistence failure.
struct ExecutionRefusingStore {
    inner: InMemoryStore,
}

#[async_trait]
impl WorkflowStore for ExecutionRefusingStore {
    async fn insert_request(&self, request: Request) -> Result<(), StoreError> {
        self.inner.insert_request(request).await
    }

    async fn insert_inspection(&self, inspection: Inspection) -> Result<(), StoreError> {
        self.inner.insert_inspection(inspection).await
    }

    async fn insert_execution(&self, execution: ProtocolExecution) -> Result<(), StoreError> {
        Err(StoreError::DuplicateId(execution.execution_id))
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<Request>, StoreError> {
        self.inner.get_request(request_id).await
    }

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ProtocolExecution>, StoreError> {
        self.inner.get_execution(execution_id).await
    }

    async fn list_inspections(&self, request_id: &str) -> Result<Vec<Inspection>, StoreError> {
        self.inner.list_inspections(request_id).await
    }

    async fn list_executions(
        &self,
        request_id: &str,
    ) -> Result<Vec<ProtocolExecution>, StoreError> {
        self.inner.list_executions(request_id).await
    }

    async fn update_inspection(&self, inspection: Inspection) -> Result<(), StoreError> {
        self.inner.update_inspection(inspection).await
    }

    async fn update_execution(&self, execution: ProtocolExecution) -> Result<(), StoreError> {
        self.inner.update_execution(execution).await
    }

    async fn remove_request(&self, request_id: &str) -> Result<(), StoreError> {
        self.inner.remove_request(request_id).await
    }
}

#[tokio::test]
async fn store_failure_during_creation_lists_what_was_created() {
    let store = Arc::new(ExecutionRefusingStore {
        inner: InMemoryStore::new(),
    });
    let coordinator =
        WorkflowCoordinator::new(store, Arc::new(ProtocolRegistry::with_builtin()));

    let result = coordinator
        .create_workflow(
            request_info("PV-2024-0128"),
            inspection_info(),
            &protocols(&["TC200"]),
        )
        .await;

    let created = match result {
        Err(CoreError::PartialCreation { created, .. }) => created,
        other => panic!("expected PartialCreation, got {other:?}"),
    };
    let kinds: Vec<_> = created.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EntityKind::Request, EntityKind::Inspection]);
}
