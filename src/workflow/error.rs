// Error taxonomy for the workflow core

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::lifecycle::state_machine::TransitionError;
use crate::workflow::traits::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Request,
    Inspection,
    Execution,
    Protocol,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Inspection => "inspection",
            Self::Execution => "execution",
            Self::Protocol => "protocol",
        };
        f.write_str(s)
    }
}

/// An entity that was successfully created before a later step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEntity {
    pub kind: EntityKind,
    pub id: String,
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input; logged at the call site, never fatal to a batch.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Workflow creation failed partway. The entities created so far are
    /// reported, not rolled back; compensation is the persistence
    /// collaborator's transactional concern.
    #[error("workflow creation failed after {} entities: {reason}", .created.len())]
    PartialCreation {
        created: Vec<CreatedEntity>,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
