//! In-memory state store for development and testing
//!
//! [`InMemoryStateStore`] is the reference implementation of
//! [`StateStore`]: thread-safe maps behind `tokio::sync::RwLock`, deep-copy
//! snapshots on every read and write, and a per-flow mutex serializing
//! `update_state` so concurrent read-modify-write cycles on the same flow
//! never interleave.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  InMemoryStateStore                                  │
//! │                                                      │
//! │  states:       RwLock<HashMap<flow_id, FlowState>>   │
//! │  audit_logs:   RwLock<HashMap<flow_id, Vec<Entry>>>  │
//! │  errors:       RwLock<HashMap<flow_id, Vec<Error>>>  │
//! │  update_locks: Mutex<HashMap<flow_id, Arc<Mutex>>>   │
//! │                                                      │
//! │  update_state(flow):                                 │
//! │    lock = update_locks[flow]      (created lazily)   │
//! │    lock.lock().await              (serializes flow)  │
//! │    scratch = states[flow].clone()                    │
//! │    update.apply(&mut scratch)?    (reject => no-op)  │
//! │    states[flow] = scratch.clone()                    │
//! │    audit_logs[flow].push(snapshot)                   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Deep copies are cheap here because [`FlowState`] owns every field by
//! value; a durable backend may replace them with transactional reads as
//! long as callers observe the same isolation.

use crate::audit::AuditEntry;
use crate::error::{Result, StateError};
use crate::model::{ExecutionError, FlowState};
use crate::traits::{StateStore, StateUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Thread-safe in-memory [`StateStore`] implementation
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<String, FlowState>>>,
    audit_logs: Arc<RwLock<HashMap<String, Vec<AuditEntry>>>>,
    errors: Arc<RwLock<HashMap<String, Vec<ExecutionError>>>>,
    update_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl InMemoryStateStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flows with persisted state
    pub async fn flow_count(&self) -> usize {
        self.states.read().await.len()
    }

    /// Drop everything; test isolation helper
    pub async fn clear(&self) {
        self.states.write().await.clear();
        self.audit_logs.write().await.clear();
        self.errors.write().await.clear();
        self.update_locks.lock().await.clear();
    }

    async fn update_lock(&self, flow_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.update_locks.lock().await;
        locks
            .entry(flow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn append_audit(&self, flow_id: &str, entry: AuditEntry) {
        self.audit_logs
            .write()
            .await
            .entry(flow_id.to_string())
            .or_default()
            .push(entry);
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_state(&self, flow_id: &str, state: &FlowState) -> Result<()> {
        let snapshot = state.clone();
        let entry = AuditEntry::snapshot(&snapshot);

        self.states
            .write()
            .await
            .insert(flow_id.to_string(), snapshot);
        self.append_audit(flow_id, entry).await;

        tracing::debug!(flow_id = %flow_id, "State saved");
        Ok(())
    }

    async fn get_state(&self, flow_id: &str) -> Result<Option<FlowState>> {
        Ok(self.states.read().await.get(flow_id).cloned())
    }

    async fn update_state(&self, flow_id: &str, update: StateUpdate) -> Result<FlowState> {
        // Serialize read-modify-write per flow id; a rejected update leaves
        // the stored state untouched.
        let lock = self.update_lock(flow_id).await;
        let _guard = lock.lock().await;

        let mut scratch = self
            .states
            .read()
            .await
            .get(flow_id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(flow_id.to_string()))?;

        update.apply(&mut scratch)?;

        let entry = match update.step_result() {
            Some(result) => AuditEntry::for_step(&scratch, result),
            None => AuditEntry::snapshot(&scratch),
        };

        self.states
            .write()
            .await
            .insert(flow_id.to_string(), scratch.clone());
        self.append_audit(flow_id, entry).await;

        tracing::debug!(flow_id = %flow_id, status = %scratch.status, "State updated");
        Ok(scratch)
    }

    async fn save_audit_log(&self, flow_id: &str, entry: AuditEntry) -> Result<()> {
        self.append_audit(flow_id, entry).await;
        Ok(())
    }

    async fn get_audit_logs(&self, flow_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit_logs
            .read()
            .await
            .get(flow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_error(&self, flow_id: &str, error: ExecutionError) -> Result<()> {
        self.errors
            .write()
            .await
            .entry(flow_id.to_string())
            .or_default()
            .push(error);
        Ok(())
    }

    async fn get_errors(&self, flow_id: &str) -> Result<Vec<ExecutionError>> {
        Ok(self
            .errors
            .read()
            .await
            .get(flow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_flow(&self, flow_id: &str) -> Result<()> {
        self.states.write().await.remove(flow_id);
        self.audit_logs.write().await.remove(flow_id);
        self.errors.write().await.remove(flow_id);
        self.update_locks.lock().await.remove(flow_id);
        Ok(())
    }
}
