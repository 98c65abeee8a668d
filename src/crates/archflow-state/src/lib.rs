//! # archflow-state - Run State, Audit, and Persistence
//!
//! **The persisted half of the archflow engine**: the run-scoped data model
//! ([`FlowState`], [`PathTree`], [`StepResult`], metrics, classified errors),
//! the append-only audit log, the implementation-neutral [`StateStore`]
//! trait, its in-memory reference implementation, and the [`StateManager`]
//! that mediates every write.
//!
//! ## Core Concepts
//!
//! ### 1. Deep-Copy Snapshot Isolation
//!
//! [`FlowState`] owns every field by value, so `Clone` is a true deep copy.
//! The store clones on every read and write: callers can mutate what they
//! hold without torn reads, and a saved snapshot can never be altered by a
//! later caller. Durable backends may substitute transactional reads - the
//! observable semantics must match.
//!
//! ### 2. Serialized Updates
//!
//! All mutation goes through [`StateUpdate`], applied inside the store's
//! per-flow critical section. Concurrent updates to one flow serialize;
//! last-writer-wins is not an acceptable implementation.
//!
//! ### 3. Append-Only Audit
//!
//! Every save appends an [`AuditEntry`] snapshot. The trail is ordered by
//! arrival and never shrinks; step-scoped entries carry the step id and its
//! result for replay and debugging.
//!
//! ### 4. Single Write Path
//!
//! The engine talks to [`StateManager`], never to a store directly. The
//! manager adds load-or-fail semantics, step-result folding (output
//! variables, metrics aggregation), and error write-through.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archflow_state::{
//!     FlowState, FlowStatus, InMemoryStateStore, StateManager, StateUpdate,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = StateManager::new(Arc::new(InMemoryStateStore::new()));
//!
//!     let state = FlowState::new("flow-1", HashMap::new());
//!     manager.save(&state).await?;
//!
//!     manager.transition("flow-1", FlowStatus::Running).await?;
//!
//!     let state = manager.load("flow-1").await?;
//!     assert_eq!(state.status, FlowStatus::Running);
//!     Ok(())
//! }
//! ```
//!
//! ## Implementing a Durable Backend
//!
//! ```rust,ignore
//! use archflow_state::{StateStore, StateUpdate, FlowState, Result};
//! use async_trait::async_trait;
//!
//! struct PostgresStateStore { pool: sqlx::PgPool }
//!
//! #[async_trait]
//! impl StateStore for PostgresStateStore {
//!     async fn update_state(&self, flow_id: &str, update: StateUpdate) -> Result<FlowState> {
//!         // SELECT ... FOR UPDATE gives the same serialization the
//!         // in-memory store gets from its per-flow mutex.
//!         todo!()
//!     }
//!     // ...
//! }
//! ```

pub mod audit;
pub mod error;
pub mod manager;
pub mod memory;
pub mod model;
pub mod traits;

pub use audit::AuditEntry;
pub use error::{Result, StateError};
pub use manager::StateManager;
pub use memory::InMemoryStateStore;
pub use model::{
    ExecutionError, ExecutionErrorType, FlowMetrics, FlowState, FlowStatus, PathNode, PathStatus,
    PathTree, StepMetrics, StepResult, StepStatus,
};
pub use traits::{PathOp, StateStore, StateUpdate};
