//! State manager
//!
//! [`StateManager`] is the single write path for run state: the engine and
//! the execution manager never touch a [`StateStore`] directly. It layers
//! convenience (load-or-fail, step audit, error recording with write-through)
//! over the store without widening its contract, so swapping the in-memory
//! reference store for a durable backend is a construction-time decision.

use crate::audit::AuditEntry;
use crate::error::{Result, StateError};
use crate::model::{ExecutionError, FlowState, FlowStatus, StepResult};
use crate::traits::{StateStore, StateUpdate};
use std::sync::Arc;

/// Mediates all reads and writes of run state
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn StateStore>,
}

impl StateManager {
    /// Wrap a store; the manager is cheap to clone and share
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// The underlying store (for audit queries by read-only consumers)
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Persist a fresh or rebuilt state snapshot
    pub async fn save(&self, state: &FlowState) -> Result<()> {
        self.store.save_state(&state.flow_id, state).await
    }

    /// Load a deep copy of the state, failing when the flow is unknown
    pub async fn load(&self, flow_id: &str) -> Result<FlowState> {
        self.store
            .get_state(flow_id)
            .await?
            .ok_or_else(|| StateError::NotFound(flow_id.to_string()))
    }

    /// Load a deep copy of the state, `None` when unknown
    pub async fn try_load(&self, flow_id: &str) -> Result<Option<FlowState>> {
        self.store.get_state(flow_id).await
    }

    /// Apply a composite update atomically; returns the updated state
    pub async fn update(&self, flow_id: &str, update: StateUpdate) -> Result<FlowState> {
        self.store.update_state(flow_id, update).await
    }

    /// Transition just the status
    pub async fn transition(&self, flow_id: &str, status: FlowStatus) -> Result<FlowState> {
        tracing::debug!(flow_id = %flow_id, status = %status, "Status transition");
        self.update(flow_id, StateUpdate::new().with_status(status))
            .await
    }

    /// Fold a step result into state: variables from output, metrics,
    /// current step pointer
    pub async fn record_step(&self, flow_id: &str, result: &StepResult) -> Result<FlowState> {
        let mut update = StateUpdate::new()
            .with_current_step(result.step_id.clone())
            .with_step_result(result.clone());

        // Object outputs merge into the variable map; scalar outputs are
        // kept under the step id.
        if let Some(output) = &result.output {
            match output.as_object() {
                Some(map) => {
                    for (key, value) in map {
                        update = update.with_variable(key.clone(), value.clone());
                    }
                }
                None => {
                    update = update.with_variable(result.step_id.clone(), output.clone());
                }
            }
        }

        self.update(flow_id, update).await
    }

    /// Record a classified error and attach it to the state
    pub async fn record_error(&self, flow_id: &str, error: ExecutionError) -> Result<()> {
        tracing::warn!(flow_id = %flow_id, error = %error, "Recording execution error");
        self.store.save_error(flow_id, error.clone()).await?;

        // Attach to state when the flow is known; error-only records (e.g.
        // admission failures) skip this.
        if self.store.get_state(flow_id).await?.is_some() {
            self.update(flow_id, StateUpdate::new().with_error(error))
                .await?;
        }
        Ok(())
    }

    /// Append an explicit audit snapshot (pause/cancel points)
    pub async fn audit(&self, state: &FlowState) -> Result<()> {
        self.store
            .save_audit_log(&state.flow_id, AuditEntry::snapshot(state))
            .await
    }

    /// The flow's audit trail
    pub async fn audit_logs(&self, flow_id: &str) -> Result<Vec<AuditEntry>> {
        self.store.get_audit_logs(flow_id).await
    }

    /// All errors recorded for the flow
    pub async fn errors(&self, flow_id: &str) -> Result<Vec<ExecutionError>> {
        self.store.get_errors(flow_id).await
    }

    /// Drop all data for the flow
    pub async fn clear(&self, flow_id: &str) -> Result<()> {
        self.store.clear_flow(flow_id).await
    }
}
