//! Error types for flow engine operations
//!
//! This module defines [`FlowError`], the single error type for all core
//! operations, plus the mapping into the persisted
//! [`ExecutionError`](archflow_state::ExecutionError) taxonomy.
//!
//! # Error Hierarchy
//!
//! ```text
//! FlowError
//! ├── NotFound        - Unknown flow or run
//! ├── Validation      - Flow structure / input invalid
//! ├── Conflict        - Run with that id already active
//! ├── Busy            - Admission rejected at capacity
//! ├── Step            - Step execution failed
//! ├── Guard           - Guard expression malformed
//! ├── Configuration   - Invalid engine or flow configuration
//! ├── InvalidState    - Operation illegal in current lifecycle status
//! ├── Timeout         - Operation exceeded its deadline
//! ├── Cancelled       - Cooperative cancellation observed
//! ├── State           - Persistence layer errors
//! ├── Serialization   - JSON errors
//! └── Yaml            - Declarative definition parse errors
//! ```
//!
//! Core operations return `Result<T>`; panics are reserved for programming
//! errors only.

use archflow_state::{ExecutionError, ExecutionErrorType, StateError};
use thiserror::Error;

/// Convenience result type using [`FlowError`]
pub type Result<T> = std::result::Result<T, FlowError>;

/// Error type for all flow engine operations
#[derive(Error, Debug)]
pub enum FlowError {
    /// Flow, run, or conversation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Flow structure or client input failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A run with this id is already active
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The active-run registry is at capacity
    #[error("Engine busy: {0}")]
    Busy(String),

    /// A step's adapter raised a fatal error
    #[error("Step '{step}' failed: {message}")]
    Step {
        /// Step that failed
        step: String,
        /// Error message from the adapter
        message: String,
    },

    /// A guard expression could not be parsed or evaluated
    #[error("Guard expression error: {0}")]
    Guard(String),

    /// Engine or flow configuration is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation is illegal in the run's current status (caller bug)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout {
        /// What timed out
        operation: String,
        /// The deadline that expired
        duration_ms: u64,
    },

    /// Cooperative cancellation observed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Persistence error from the state layer
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error from a declarative flow definition
    #[error("Definition parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FlowError {
    /// Create a step failure with context
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: message.into(),
        }
    }

    /// The taxonomy classification this error maps to when recorded
    pub fn classification(&self) -> ExecutionErrorType {
        match self {
            Self::NotFound(_) => ExecutionErrorType::NotFound,
            Self::Validation(_) | Self::Guard(_) => ExecutionErrorType::Validation,
            Self::Conflict(_) | Self::InvalidState(_) => ExecutionErrorType::InvalidState,
            Self::Busy(_) => ExecutionErrorType::System,
            Self::Step { .. } | Self::Cancelled(_) => ExecutionErrorType::Execution,
            Self::Configuration(_) => ExecutionErrorType::Configuration,
            Self::Timeout { .. } => ExecutionErrorType::Timeout,
            Self::State(StateError::NotFound(_)) => ExecutionErrorType::NotFound,
            Self::State(StateError::InvalidTransition { .. }) => ExecutionErrorType::InvalidState,
            Self::State(_) => ExecutionErrorType::System,
            Self::Serialization(_) | Self::Yaml(_) => ExecutionErrorType::Validation,
        }
    }

    /// Convert into a persisted [`ExecutionError`] attributed to `component`
    pub fn to_execution_error(&self, component: &str) -> ExecutionError {
        let code = match self {
            Self::NotFound(_) => "FLOW_NOT_FOUND",
            Self::Validation(_) => "FLOW_VALIDATION_FAILED",
            Self::Conflict(_) => "FLOW_ALREADY_ACTIVE",
            Self::Busy(_) => "ENGINE_AT_CAPACITY",
            Self::Step { .. } => "STEP_EXECUTION_FAILED",
            Self::Guard(_) => "GUARD_EXPRESSION_INVALID",
            Self::Configuration(_) => "CONFIGURATION_INVALID",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Timeout { .. } => "OPERATION_TIMEOUT",
            Self::Cancelled(_) => "EXECUTION_CANCELLED",
            Self::State(_) => "STATE_STORE_FAILURE",
            Self::Serialization(_) => "SERIALIZATION_FAILED",
            Self::Yaml(_) => "DEFINITION_PARSE_FAILED",
        };
        ExecutionError::new(self.classification(), code, self.to_string())
            .with_component(component)
    }
}
