//! Store abstractions
//!
//! [`StateStore`] is the implementation-neutral persistence interface the
//! engine writes through. The in-memory reference implementation lives in
//! [`crate::memory`]; durable backends (Postgres, Redis, ...) implement the
//! same trait and must preserve the same observable semantics:
//!
//! - **Snapshot isolation** - `get_state` returns a copy the caller may
//!   mutate freely; `save_state` copies before storing.
//! - **Serialized updates** - `update_state` is an atomic read-modify-write
//!   per flow id; concurrent updates to the same flow are serialized, never
//!   last-writer-wins.
//! - **Ordered audit** - audit entries are append-only in arrival order.
//!
//! [`StateUpdate`] is the unit of mutation: a small builder describing the
//! status transition, variable merges, and metric folds to apply inside the
//! store's per-flow critical section.

use crate::audit::AuditEntry;
use crate::error::Result;
use crate::model::{ExecutionError, FlowState, FlowStatus, PathStatus, StepResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// One mutation of the execution-path tree, applied inside a [`StateUpdate`]
#[derive(Debug, Clone)]
pub enum PathOp {
    /// Create the root path
    StartRoot(String),
    /// Spawn a child path under a parent (parallel branch)
    SpawnChild {
        /// Parent path id
        parent: String,
        /// New child path id
        path_id: String,
    },
    /// Record a completed step on a path
    RecordStep {
        /// Path the step ran on
        path_id: String,
        /// Completed step
        step_id: String,
    },
    /// Set a non-terminal control status
    SetStatus {
        /// Path to touch
        path_id: String,
        /// RUNNING or PAUSED
        status: PathStatus,
    },
    /// Mark a path COMPLETED (children must be terminal)
    Complete(String),
    /// Mark a path FAILED
    Fail(String),
    /// Fold a path into its parent at a join (children must be terminal)
    Merge(String),
}

/// A composite mutation applied atomically to one flow's state
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    status: Option<FlowStatus>,
    current_step_id: Option<String>,
    variables: HashMap<String, Value>,
    step_result: Option<StepResult>,
    error: Option<ExecutionError>,
    path_ops: Vec<PathOp>,
}

impl StateUpdate {
    /// Empty update; chain `with_*` calls to describe the mutation
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition the run status (validated against the lifecycle)
    pub fn with_status(mut self, status: FlowStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the step the manager is currently at
    pub fn with_current_step(mut self, step_id: impl Into<String>) -> Self {
        self.current_step_id = Some(step_id.into());
        self
    }

    /// Merge one variable
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Merge a map of variables
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    /// Fold a step result in: aggregates metrics and bumps completed-steps
    pub fn with_step_result(mut self, result: StepResult) -> Self {
        self.step_result = Some(result);
        self
    }

    /// Attach a fatal error to the state
    pub fn with_error(mut self, error: ExecutionError) -> Self {
        self.error = Some(error);
        self
    }

    /// Append an execution-path mutation; ops apply in insertion order
    pub fn with_path_op(mut self, op: PathOp) -> Self {
        self.path_ops.push(op);
        self
    }

    /// The step result carried by this update, if any
    pub fn step_result(&self) -> Option<&StepResult> {
        self.step_result.as_ref()
    }

    /// Apply this update to a state in place
    ///
    /// Order matters: the status transition runs last so that an illegal
    /// transition rejects the whole update without partial effects only when
    /// the caller checks the result before persisting - the store's
    /// `update_state` applies to a scratch copy and discards it on error.
    pub fn apply(&self, state: &mut FlowState) -> Result<()> {
        if let Some(step_id) = &self.current_step_id {
            state.current_step_id = Some(step_id.clone());
        }
        if !self.variables.is_empty() {
            state.merge_variables(self.variables.clone());
        }
        if let Some(result) = &self.step_result {
            state.metrics.aggregate(result.metrics.clone());
        }
        if let Some(error) = &self.error {
            state.set_error(error.clone());
        }
        for op in &self.path_ops {
            match op {
                PathOp::StartRoot(path_id) => {
                    state.execution_paths.start_root(path_id.clone())?
                }
                PathOp::SpawnChild { parent, path_id } => {
                    state.execution_paths.spawn_child(parent, path_id.clone())?
                }
                PathOp::RecordStep { path_id, step_id } => {
                    state.execution_paths.record_step(path_id, step_id.clone())?
                }
                PathOp::SetStatus { path_id, status } => {
                    state.execution_paths.set_status(path_id, *status)?
                }
                PathOp::Complete(path_id) => state.execution_paths.complete(path_id)?,
                PathOp::Fail(path_id) => state.execution_paths.fail(path_id)?,
                PathOp::Merge(path_id) => state.execution_paths.merge(path_id)?,
            }
        }
        if let Some(status) = self.status {
            state.transition_to(status)?;
        }
        Ok(())
    }
}

/// Implementation-neutral persistence interface for flow state
///
/// All methods take the flow id explicitly; implementations key their storage
/// and their update serialization on it.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Deep-copy `state` into the store and append an audit snapshot
    async fn save_state(&self, flow_id: &str, state: &FlowState) -> Result<()>;

    /// Deep copy of the current state, or `None` when unknown
    async fn get_state(&self, flow_id: &str) -> Result<Option<FlowState>>;

    /// Atomic read-modify-write; returns the updated state (a copy)
    async fn update_state(&self, flow_id: &str, update: StateUpdate) -> Result<FlowState>;

    /// Append one audit entry, preserving arrival order
    async fn save_audit_log(&self, flow_id: &str, entry: AuditEntry) -> Result<()>;

    /// The flow's audit trail in append order
    async fn get_audit_logs(&self, flow_id: &str) -> Result<Vec<AuditEntry>>;

    /// Record a classified error
    async fn save_error(&self, flow_id: &str, error: ExecutionError) -> Result<()>;

    /// All errors recorded for the flow, in arrival order
    async fn get_errors(&self, flow_id: &str) -> Result<Vec<ExecutionError>>;

    /// Drop all data for the flow (state, audit, errors)
    async fn clear_flow(&self, flow_id: &str) -> Result<()>;
}
