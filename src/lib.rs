// PV Lab Core - Test Lifecycle & QC Evaluation
// This exposes the core components for testing and integration

pub mod cli;
pub mod config;
pub mod lifecycle;
pub mod protocols;
pub mod qc;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use config::LabConfig;
pub use lifecycle::{
    derive_request_status, progress_percent, ExecutionStatus, FlagType, Inspection, Measurement,
    ProtocolExecution, QcFlag, Request, RequestStatus, StateTransitionRecord, TransitionError,
};
pub use protocols::{ProtocolDescriptor, ProtocolRegistry};
pub use qc::{evaluate, OutlierMethod, Rule, RuleAction, RuleKind, RuleSet};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry};
pub use workflow::{
    AdvanceOutcome, CoreError, CreatedEntity, EntityKind, InMemoryStore, InspectionInfo,
    RequestInfo, RuleSource, StoreError, WorkflowCoordinator, WorkflowHandle, WorkflowStatus,
    WorkflowStore,
};
