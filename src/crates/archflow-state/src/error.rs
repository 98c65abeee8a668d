//! Error types for state store operations

use crate::model::FlowStatus;
use thiserror::Error;

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur during state persistence and mutation
#[derive(Error, Debug)]
pub enum StateError {
    /// No persisted state exists for the given flow
    #[error("No state found for flow '{0}'")]
    NotFound(String),

    /// A status transition violated the flow lifecycle
    #[error("Illegal status transition {from} -> {to} for flow '{flow_id}'")]
    InvalidTransition {
        flow_id: String,
        from: FlowStatus,
        to: FlowStatus,
    },

    /// An execution-path operation violated a tree invariant
    #[error("Execution path error: {0}")]
    Path(String),

    /// State could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific storage failure
    #[error("Store error: {0}")]
    Store(String),
}
