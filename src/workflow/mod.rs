// Workflow Module
//
// The coordinator and its collaborator boundaries. The four operations on
// WorkflowCoordinator (create_workflow, record_measurement, advance,
// next_actions) plus the two read projections are the public surface of the
// core.

pub mod coordinator;
pub mod error;
pub mod store;
pub mod traits;

pub use coordinator::{
    AdvanceOutcome, ExecutionHandle, ExecutionSummary, InspectionInfo, RequestInfo,
    WorkflowCoordinator, WorkflowHandle, WorkflowStatus, DEFAULT_HISTORY_CAP,
};
pub use error::{CoreError, CreatedEntity, EntityKind};
pub use store::{InMemoryStore, StoreSnapshot};
pub use traits::{RuleSource, StoreError, WorkflowStore};
