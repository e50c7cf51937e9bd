// Collaborator boundaries - separating concerns for testability
//
// The core exchanges plain data with a rule source and a persistence
// collaborator through these traits. Neither side owns a wire protocol or
// file format; the snapshot store in store.rs is one implementation.

use async_trait::async_trait;
use thiserror::Error;

use crate::lifecycle::types::{Inspection, ProtocolExecution, Request};
use crate::qc::RuleSet;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate id: {0}")]
    DuplicateId(String),
    #[error("unknown id: {0}")]
    UnknownId(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Source of QC rule sets, keyed by protocol code. All rules of a protocol
/// load together; there are no partial rule sets.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load_rule_set(&self, protocol_code: &str) -> Result<RuleSet, StoreError>;
}

/// Persistence collaborator for the workflow aggregates.
///
/// Keys are opaque string ids. Each insert is atomic for the entity it
/// creates; cross-entity transactions are the implementation's concern.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert_request(&self, request: Request) -> Result<(), StoreError>;
    async fn insert_inspection(&self, inspection: Inspection) -> Result<(), StoreError>;
    async fn insert_execution(&self, execution: ProtocolExecution) -> Result<(), StoreError>;

    async fn get_request(&self, request_id: &str) -> Result<Option<Request>, StoreError>;
    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ProtocolExecution>, StoreError>;

    async fn list_inspections(&self, request_id: &str) -> Result<Vec<Inspection>, StoreError>;
    async fn list_executions(&self, request_id: &str)
        -> Result<Vec<ProtocolExecution>, StoreError>;

    async fn update_inspection(&self, inspection: Inspection) -> Result<(), StoreError>;
    async fn update_execution(&self, execution: ProtocolExecution) -> Result<(), StoreError>;

    /// Remove a request and everything it owns (cascade delete).
    async fn remove_request(&self, request_id: &str) -> Result<(), StoreError>;
}
