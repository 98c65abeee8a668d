//! Run-scoped mutable state
//!
//! [`FlowState`] is the only mutable entity the store persists. Every field
//! is owned by value (`String`, maps of `serde_json::Value`, the path arena),
//! so `Clone` is a genuine deep copy - the snapshot-isolation guarantee of
//! the store rests on that property.
//!
//! Status transitions go through [`FlowState::transition_to`], which enforces
//! the lifecycle of [`FlowStatus`] and makes terminal statuses sticky: once a
//! run is COMPLETED, FAILED, or STOPPED, any further transition is rejected.

use super::execution_error::ExecutionError;
use super::metrics::FlowMetrics;
use super::path::PathTree;
use super::status::FlowStatus;
use crate::error::{Result, StateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Mutable run-scoped state for one flow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    /// Flow this state belongs to
    pub flow_id: String,

    /// Lifecycle status
    pub status: FlowStatus,

    /// Step the execution manager last dispatched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,

    /// Variable map seeded from client input and fed by step outputs
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Tree of execution paths
    #[serde(default)]
    pub execution_paths: PathTree,

    /// Aggregated run metrics
    #[serde(default)]
    pub metrics: FlowMetrics,

    /// Fatal error, set when the run FAILED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl FlowState {
    /// Fresh INITIALIZED state seeded with client input
    pub fn new(flow_id: impl Into<String>, input: HashMap<String, Value>) -> Self {
        Self {
            flow_id: flow_id.into(),
            status: FlowStatus::Initialized,
            current_step_id: None,
            variables: input,
            execution_paths: PathTree::new(),
            metrics: FlowMetrics::default(),
            error: None,
        }
    }

    /// Transition the run's status, enforcing the lifecycle
    pub fn transition_to(&mut self, next: FlowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                flow_id: self.flow_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_final() {
            self.metrics.finish();
        }
        Ok(())
    }

    /// Set one variable
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Merge a map of variables; later entries win on key collision
    pub fn merge_variables(&mut self, updates: HashMap<String, Value>) {
        self.variables.extend(updates);
    }

    /// Read one variable
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Attach the fatal error; does not change status
    pub fn set_error(&mut self, error: ExecutionError) {
        self.error = Some(error);
    }

    /// Whether the run can still make progress
    pub fn can_continue(&self) -> bool {
        self.status.can_continue()
    }
}
