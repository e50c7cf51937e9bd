//! In-memory workflow store with JSON snapshot persistence.
//!
//! The snapshot format exists so the CLI can carry state between
//! invocations; it is a collaborator implementation, not part of the core
//! contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

use super::traits::{StoreError, WorkflowStore};
use crate::lifecycle::types::{Inspection, ProtocolExecution, Request};

#[derive(Debug, Default)]
struct StoreState {
    requests: HashMap<String, Request>,
    inspections: HashMap<String, Inspection>,
    executions: HashMap<String, ProtocolExecution>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub requests: Vec<Request>,
    pub inspections: Vec<Inspection>,
    pub executions: Vec<ProtocolExecution>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read().await;
        StoreSnapshot {
            requests: state.requests.values().cloned().collect(),
            inspections: state.inspections.values().cloned().collect(),
            executions: state.executions.values().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let state = StoreState {
            requests: snapshot
                .requests
                .into_iter()
                .map(|r| (r.request_id.clone(), r))
                .collect(),
            inspections: snapshot
                .inspections
                .into_iter()
                .map(|i| (i.inspection_id.clone(), i))
                .collect(),
            executions: snapshot
                .executions
                .into_iter()
                .map(|e| (e.execution_id.clone(), e))
                .collect(),
        };
        Self {
            state: RwLock::new(state),
        }
    }

    pub async fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let snapshot = self.snapshot().await;
        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path.as_ref(), json).await?;
        info!(path = %path.as_ref().display(), "Saved workflow state snapshot");
        Ok(())
    }

    /// Load a snapshot; a missing file yields an empty store.
    pub async fn load_from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        match tokio::fs::read_to_string(path.as_ref()).await {
            Ok(json) => {
                let snapshot: StoreSnapshot = serde_json::from_str(&json)?;
                Ok(Self::from_snapshot(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn insert_request(&self, request: Request) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.requests.contains_key(&request.request_id) {
            return Err(StoreError::DuplicateId(request.request_id));
        }
        state.requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    async fn insert_inspection(&self, inspection: Inspection) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.requests.contains_key(&inspection.request_id) {
            return Err(StoreError::UnknownId(inspection.request_id));
        }
        if state.inspections.contains_key(&inspection.inspection_id) {
            return Err(StoreError::DuplicateId(inspection.inspection_id));
        }
        state
            .inspections
            .insert(inspection.inspection_id.clone(), inspection);
        Ok(())
    }

    async fn insert_execution(&self, execution: ProtocolExecution) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.requests.contains_key(&execution.request_id) {
            return Err(StoreError::UnknownId(execution.request_id));
        }
        if state.executions.contains_key(&execution.execution_id) {
            return Err(StoreError::DuplicateId(execution.execution_id));
        }
        state
            .executions
            .insert(execution.execution_id.clone(), execution);
        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<Request>, StoreError> {
        Ok(self.state.read().await.requests.get(request_id).cloned())
    }

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ProtocolExecution>, StoreError> {
        Ok(self.state.read().await.executions.get(execution_id).cloned())
    }

    async fn list_inspections(&self, request_id: &str) -> Result<Vec<Inspection>, StoreError> {
        let state = self.state.read().await;
        let mut inspections: Vec<_> = state
            .inspections
            .values()
            .filter(|i| i.request_id == request_id)
            .cloned()
            .collect();
        inspections.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(inspections)
    }

    async fn list_executions(
        &self,
        request_id: &str,
    ) -> Result<Vec<ProtocolExecution>, StoreError> {
        let state = self.state.read().await;
        let mut executions: Vec<_> = state
            .executions
            .values()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(executions)
    }

    async fn update_inspection(&self, inspection: Inspection) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.inspections.contains_key(&inspection.inspection_id) {
            return Err(StoreError::UnknownId(inspection.inspection_id));
        }
        state
            .inspections
            .insert(inspection.inspection_id.clone(), inspection);
        Ok(())
    }

    async fn update_execution(&self, execution: ProtocolExecution) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.executions.contains_key(&execution.execution_id) {
            return Err(StoreError::UnknownId(execution.execution_id));
        }
        state
            .executions
            .insert(execution.execution_id.clone(), execution);
        Ok(())
    }

    async fn remove_request(&self, request_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.requests.remove(request_id).is_none() {
            return Err(StoreError::UnknownId(request_id.to_string()));
        }
        state.inspections.retain(|_, i| i.request_id != request_id);
        state.executions.retain(|_, e| e.request_id != request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::lifecycle::types::ExecutionStatus;

    fn request(id: &str) -> Request {
        Request {
            request_id: id.to_string(),
            sample_id: "PV-0001".to_string(),
            module_type: "mono-perc-400".to_string(),
            requested_by: None,
            created_at: Utc::now(),
        }
    }

    fn execution(id: &str, request_id: &str) -> ProtocolExecution {
        ProtocolExecution {
            execution_id: id.to_string(),
            request_id: request_id.to_string(),
            protocol_code: "TC200".to_string(),
            status: ExecutionStatus::NotStarted,
            measurements: Vec::new(),
            flags: Vec::new(),
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = InMemoryStore::new();
        store.insert_request(request("req-1")).await.unwrap();
        store
            .insert_execution(execution("exec-1", "req-1"))
            .await
            .unwrap();

        let found = store.get_execution("exec-1").await.unwrap().unwrap();
        assert_eq!(found.request_id, "req-1");
        assert!(store.get_execution("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execution_requires_existing_request() {
        let store = InMemoryStore::new();
        let result = store.insert_execution(execution("exec-1", "ghost")).await;
        assert!(matches!(result, Err(StoreError::UnknownId(_))));
    }

    #[tokio::test]
    async fn remove_request_cascades() {
        let store = InMemoryStore::new();
        store.insert_request(request("req-1")).await.unwrap();
        store
            .insert_execution(execution("exec-1", "req-1"))
            .await
            .unwrap();

        store.remove_request("req-1").await.unwrap();
        assert!(store.get_request("req-1").await.unwrap().is_none());
        assert!(store.get_execution("exec-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let store = InMemoryStore::new();
        store.insert_request(request("req-1")).await.unwrap();
        store
            .insert_execution(execution("exec-1", "req-1"))
            .await
            .unwrap();

        let restored = InMemoryStore::from_snapshot(store.snapshot().await);
        assert!(restored.get_request("req-1").await.unwrap().is_some());
        assert!(restored.get_execution("exec-1").await.unwrap().is_some());
    }
}
