//! Append-only audit log entries
//!
//! Every state save produces an [`AuditEntry`] holding a deep-copied
//! [`FlowState`] snapshot; step completions additionally carry the step id
//! and its [`StepResult`]. Entries are ordered by arrival within a flow and
//! never mutated - readers always see a monotonically growing prefix.

use crate::model::{FlowState, StepResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable snapshot in a flow's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Flow this entry belongs to
    pub flow_id: String,

    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// Deep copy of the state at snapshot time
    pub state: FlowState,

    /// Step that triggered the snapshot, when step-scoped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// Result of that step, when step-scoped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_result: Option<StepResult>,
}

impl AuditEntry {
    /// Snapshot the given state (cloned into the entry)
    pub fn snapshot(state: &FlowState) -> Self {
        Self {
            flow_id: state.flow_id.clone(),
            timestamp: Utc::now(),
            state: state.clone(),
            step_id: None,
            step_result: None,
        }
    }

    /// Snapshot scoped to a completed step
    pub fn for_step(state: &FlowState, result: &StepResult) -> Self {
        Self {
            flow_id: state.flow_id.clone(),
            timestamp: Utc::now(),
            state: state.clone(),
            step_id: Some(result.step_id.clone()),
            step_result: Some(result.clone()),
        }
    }
}
