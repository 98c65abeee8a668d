//! Classified execution errors
//!
//! Every failure the engine records is an [`ExecutionError`] carrying a
//! [`ExecutionErrorType`] classification, a stable code, the component that
//! raised it, and an optional detail map. The classification drives retry
//! decisions: only EXECUTION, CONNECTION, and TIMEOUT are retryable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Classification of an execution error
///
/// The type determines propagation policy:
///
/// | Type | Retry |
/// |------|-------|
/// | `Configuration` | never (fail fast) |
/// | `Validation` | never (fail fast, field-level detail) |
/// | `Execution` | per policy |
/// | `Connection` | per policy, with backoff |
/// | `Timeout` | once, then surfaced |
/// | `Authorization` | never |
/// | `NotFound` | never |
/// | `InvalidState` | never (caller bug) |
/// | `System` | never (resource exhaustion) |
/// | `Unknown` | never (programming error) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionErrorType {
    Configuration,
    Validation,
    Execution,
    System,
    Connection,
    Authorization,
    Timeout,
    NotFound,
    InvalidState,
    Unknown,
}

impl ExecutionErrorType {
    /// Whether the retry policy may be consulted for this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution | Self::Connection | Self::Timeout)
    }
}

impl fmt::Display for ExecutionErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "CONFIGURATION",
            Self::Validation => "VALIDATION",
            Self::Execution => "EXECUTION",
            Self::System => "SYSTEM",
            Self::Connection => "CONNECTION",
            Self::Authorization => "AUTHORIZATION",
            Self::Timeout => "TIMEOUT",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// A recorded execution failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Classification driving retry and propagation
    pub error_type: ExecutionErrorType,

    /// Stable machine-readable code, e.g. `"STEP_EXECUTION_FAILED"`
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Component that raised the error, e.g. `"execution-manager"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    /// When the error was created
    pub timestamp: DateTime<Utc>,

    /// Underlying cause, flattened to a string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,

    /// Structured context (field-level validation detail, retry attempts, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ExecutionError {
    /// Create an error with the given classification, code, and message
    pub fn new(
        error_type: ExecutionErrorType,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            code: code.into(),
            message: message.into(),
            component: None,
            timestamp: Utc::now(),
            cause: None,
            details: HashMap::new(),
        }
    }

    /// Shorthand for an EXECUTION-classified error
    pub fn execution(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorType::Execution, code, message)
    }

    /// Shorthand for a VALIDATION-classified error
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorType::Validation, code, message)
    }

    /// Shorthand for a TIMEOUT-classified error
    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorType::Timeout, code, message)
    }

    /// Shorthand for a NOT_FOUND-classified error
    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorType::NotFound, code, message)
    }

    /// Attach the originating component
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Attach the underlying cause
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Attach one structured detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Whether the retry policy may be consulted for this error
    pub fn is_retryable(&self) -> bool {
        self.error_type.is_retryable()
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.error_type, self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionError {}
