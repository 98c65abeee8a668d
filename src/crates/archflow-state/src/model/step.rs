//! Step results
//!
//! A [`StepResult`] is the immutable outcome of one step invocation. The
//! execution manager folds results into [`FlowState`](super::FlowState) and
//! the audit log; nothing mutates a result after it is emitted.

use super::execution_error::ExecutionError;
use super::metrics::StepMetrics;
use super::status::StepStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable outcome of a single step invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Step this result belongs to
    pub step_id: String,

    /// Outcome status
    pub status: StepStatus,

    /// Output produced by the adapter, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Wall-clock metrics for the invocation
    pub metrics: StepMetrics,

    /// Errors raised during the invocation (empty on success)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExecutionError>,
}

impl StepResult {
    /// Successful result with output
    pub fn completed(step_id: impl Into<String>, output: Value, metrics: StepMetrics) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Completed,
            output: Some(output),
            metrics,
            errors: Vec::new(),
        }
    }

    /// Failed result carrying the error that killed the step
    pub fn failed(step_id: impl Into<String>, error: ExecutionError, metrics: StepMetrics) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            metrics,
            errors: vec![error],
        }
    }

    /// Result for a step whose guards routed execution around it
    pub fn skipped(step_id: impl Into<String>) -> Self {
        let step_id = step_id.into();
        Self {
            metrics: StepMetrics {
                step_id: step_id.clone(),
                ..StepMetrics::default()
            },
            step_id,
            status: StepStatus::Skipped,
            output: None,
            errors: Vec::new(),
        }
    }

    /// Result for a step that observed cancellation
    pub fn cancelled(step_id: impl Into<String>) -> Self {
        Self::control(step_id, StepStatus::Cancelled)
    }

    /// Result for a step that observed a pause request
    pub fn paused(step_id: impl Into<String>) -> Self {
        Self::control(step_id, StepStatus::Paused)
    }

    /// Result for a step whose deadline expired
    pub fn timed_out(
        step_id: impl Into<String>,
        error: ExecutionError,
        metrics: StepMetrics,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Timeout,
            output: None,
            metrics,
            errors: vec![error],
        }
    }

    fn control(step_id: impl Into<String>, status: StepStatus) -> Self {
        let step_id = step_id.into();
        Self {
            metrics: StepMetrics {
                step_id: step_id.clone(),
                ..StepMetrics::default()
            },
            step_id,
            status,
            output: None,
            errors: Vec::new(),
        }
    }

    /// Whether this outcome counts as success for routing
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The first (primary) error, when the step failed
    pub fn primary_error(&self) -> Option<&ExecutionError> {
        self.errors.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completed_result() {
        let r = StepResult::completed("A", json!({"y": 2}), StepMetrics::started("A"));
        assert!(r.is_success());
        assert_eq!(r.output, Some(json!({"y": 2})));
        assert!(r.errors.is_empty());
    }

    #[test]
    fn test_failed_result_carries_error() {
        let err = ExecutionError::execution("BOOM", "it broke");
        let r = StepResult::failed("B", err, StepMetrics::started("B"));
        assert!(!r.is_success());
        assert_eq!(r.primary_error().unwrap().code, "BOOM");
    }

    #[test]
    fn test_skipped_counts_as_success() {
        let r = StepResult::skipped("C");
        assert!(r.is_success());
        assert_eq!(r.status, StepStatus::Skipped);
        assert_eq!(r.metrics.step_id, "C");
    }

    #[test]
    fn test_control_results() {
        assert_eq!(StepResult::cancelled("X").status, StepStatus::Cancelled);
        assert_eq!(StepResult::paused("X").status, StepStatus::Paused);
    }
}
