// Test Lifecycle Module
//
// Entity types and the execution state machine. Request aggregate status is
// derived from the execution set, never stored redundantly.

pub mod state_machine;
pub mod types;

pub use state_machine::{
    apply_transition, derive_request_status, is_transition_allowed, progress_percent,
    StateTransitionRecord, TransitionError,
};
pub use types::{
    ExecutionStatus, FlagType, Inspection, Measurement, ProtocolExecution, QcFlag, Request,
    RequestStatus,
};
