//! Flow engine
//!
//! The engine is the client-facing surface: it admits runs, owns the
//! active-run registry, and drives lifecycle (start, resume, pause, cancel).
//! All collaborators - state store, step adapters, interceptor chain, event
//! bus - are injected at construction; the engine is the wiring, not a
//! singleton.
//!
//! # Admission
//!
//! `start_flow` validates the plan, persists a fresh INITIALIZED
//! [`FlowState`] seeded from the input, registers the run, and spawns the
//! execution manager onto the runtime. Admission fails fast with:
//!
//! - [`FlowError::NotFound`] - unknown flow id
//! - [`FlowError::Validation`] - malformed plan
//! - [`FlowError::Conflict`] - a run with that id is already active
//! - [`FlowError::Busy`] - the registry is at `max_concurrent_flows`
//!   (no queueing; callers that want a queue wrap `start_flow`)
//!
//! # Pause / Cancel
//!
//! Both set a flag on the run's [`ControlFlags`]; the execution manager
//! observes it at the next suspension point and persists the transition.
//! `pause` returns once the state is durably PAUSED; `cancel` removes the
//! run from the registry and returns once the state is terminal. A paused
//! run has no active task, so cancelling it transitions the store directly.

use crate::config::AgentConfig;
use crate::context::{ControlFlags, ExecutionContext};
use crate::error::{FlowError, Result};
use crate::event::{ArchflowEvent, EventBus};
use crate::flow::Flow;
use crate::interceptor::InterceptorChain;
use crate::manager::{ExecutionManager, FlowResult};
use crate::step::StepExecutorRegistry;
use archflow_state::{FlowMetrics, FlowState, FlowStatus, StateManager, StateStore, StateUpdate};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle on a spawned run; join it for the [`FlowResult`]
#[derive(Debug)]
pub struct FlowHandle {
    flow_id: String,
    handle: JoinHandle<Result<FlowResult>>,
}

impl FlowHandle {
    /// Flow this handle belongs to
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Wait for the run to reach PAUSED, STOPPED, or a terminal status
    pub async fn join(self) -> Result<FlowResult> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_error) => Err(FlowError::InvalidState(format!(
                "run task for flow '{}' aborted: {}",
                self.flow_id, join_error
            ))),
        }
    }
}

struct ActiveRun {
    control: ControlFlags,
}

/// Client-facing engine: admission, lifecycle, active-run registry
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: AgentConfig,
    flows: DashMap<String, Flow>,
    active: DashMap<String, ActiveRun>,
    admission: Mutex<()>,
    state: StateManager,
    events: EventBus,
    manager: ExecutionManager,
}

impl FlowEngine {
    /// Wire an engine from its collaborators
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        executors: StepExecutorRegistry,
        chain: InterceptorChain,
        events: EventBus,
    ) -> Self {
        let state = StateManager::new(store);
        let manager = ExecutionManager::new(state.clone(), executors, Arc::new(chain));
        Self {
            inner: Arc::new(EngineInner {
                config,
                flows: DashMap::new(),
                active: DashMap::new(),
                admission: Mutex::new(()),
                state,
                events,
                manager,
            }),
        }
    }

    /// Put a flow in the catalog; validates the plan first
    pub fn register_flow(&self, flow: Flow) -> Result<()> {
        flow.validate()?;
        tracing::debug!(flow_id = %flow.flow_id, steps = flow.steps.len(), "Flow registered");
        self.inner.flows.insert(flow.flow_id.clone(), flow);
        Ok(())
    }

    /// The event bus runs emit on
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The state manager (for audit queries)
    pub fn state(&self) -> &StateManager {
        &self.inner.state
    }

    /// Start a catalogued flow with the given input
    pub async fn start_flow(
        &self,
        flow_id: &str,
        input: HashMap<String, Value>,
    ) -> Result<FlowHandle> {
        let flow = self
            .inner
            .flows
            .get(flow_id)
            .map(|f| f.clone())
            .ok_or_else(|| FlowError::NotFound(format!("flow '{}'", flow_id)))?;
        self.execute(flow, input).await
    }

    /// Start a caller-provided (in-memory) flow
    pub async fn execute(&self, flow: Flow, input: HashMap<String, Value>) -> Result<FlowHandle> {
        flow.validate()?;
        let flow_id = flow.flow_id.clone();

        let control = {
            let _admission = self.inner.admission.lock();
            if self.inner.active.contains_key(&flow_id) {
                return Err(FlowError::Conflict(format!(
                    "flow '{}' already has an active run",
                    flow_id
                )));
            }
            if self.inner.active.len() >= self.inner.config.max_concurrent_flows {
                return Err(FlowError::Busy(format!(
                    "active-run registry is at capacity ({})",
                    self.inner.config.max_concurrent_flows
                )));
            }
            let control = ControlFlags::new();
            self.inner.active.insert(
                flow_id.clone(),
                ActiveRun {
                    control: control.clone(),
                },
            );
            control
        };

        // Fresh INITIALIZED state seeded from the input
        let mut state = FlowState::new(&flow_id, input);
        state.metrics = FlowMetrics::started(flow.steps.len());
        if let Err(e) = self.inner.state.save(&state).await {
            self.inner.active.remove(&flow_id);
            return Err(e.into());
        }

        self.inner
            .events
            .emit(ArchflowEvent::flow_started(&flow_id));

        Ok(self.spawn_run(flow, control))
    }

    /// Resume a persisted, non-terminal run; `context` merges into the
    /// variables before dispatch
    pub async fn resume_flow(
        &self,
        flow_id: &str,
        context: HashMap<String, Value>,
    ) -> Result<FlowHandle> {
        let flow = self
            .inner
            .flows
            .get(flow_id)
            .map(|f| f.clone())
            .ok_or_else(|| FlowError::NotFound(format!("flow '{}'", flow_id)))?;

        let state = self.inner.state.load(flow_id).await?;
        if state.status.is_final() {
            return Err(FlowError::InvalidState(format!(
                "flow '{}' is already {}",
                flow_id, state.status
            )));
        }

        let control = {
            let _admission = self.inner.admission.lock();
            if self.inner.active.contains_key(flow_id) {
                return Err(FlowError::Conflict(format!(
                    "flow '{}' already has an active run",
                    flow_id
                )));
            }
            let control = ControlFlags::new();
            self.inner.active.insert(
                flow_id.to_string(),
                ActiveRun {
                    control: control.clone(),
                },
            );
            control
        };

        if !context.is_empty() {
            let update = StateUpdate::new().with_variables(context);
            if let Err(e) = self.inner.state.update(flow_id, update).await {
                self.inner.active.remove(flow_id);
                return Err(e.into());
            }
        }

        tracing::info!(flow_id = %flow_id, "Resuming flow");
        Ok(self.spawn_run(flow, control))
    }

    /// Signal a pause and wait until the state is durably PAUSED
    pub async fn pause(&self, flow_id: &str) -> Result<()> {
        let state = self.inner.state.load(flow_id).await?;
        match state.status {
            FlowStatus::Paused => return Ok(()),
            status if status.is_final() => {
                return Err(FlowError::InvalidState(format!(
                    "flow '{}' is already {}",
                    flow_id, status
                )))
            }
            _ => {}
        }

        match self.inner.active.get(flow_id) {
            Some(run) => run.control.request_pause(),
            None => {
                // No task to observe the flag; transition directly
                self.inner
                    .state
                    .transition(flow_id, FlowStatus::Paused)
                    .await?;
                return Ok(());
            }
        }

        self.wait_for_status(flow_id, |status| {
            status == FlowStatus::Paused || status.is_final()
        })
        .await?;
        self.inner.active.remove(flow_id);
        tracing::info!(flow_id = %flow_id, "Flow durably paused");
        Ok(())
    }

    /// Signal cooperative termination, wait for it, drop from the registry
    pub async fn cancel(&self, flow_id: &str) -> Result<()> {
        let state = self.inner.state.load(flow_id).await?;
        if state.status.is_final() {
            self.inner.active.remove(flow_id);
            return Err(FlowError::InvalidState(format!(
                "flow '{}' is already {}",
                flow_id, state.status
            )));
        }

        match self.inner.active.get(flow_id) {
            Some(run) => {
                run.control.request_cancel();
                drop(run);
                self.wait_for_status(flow_id, |status| status.is_final())
                    .await?;
            }
            None => {
                // Paused or initialized run with no task: transition directly
                self.inner
                    .state
                    .transition(flow_id, FlowStatus::Stopped)
                    .await?;
                let stopped = self.inner.state.load(flow_id).await?;
                self.inner.state.audit(&stopped).await?;
            }
        }

        self.inner.active.remove(flow_id);
        self.inner
            .events
            .emit(ArchflowEvent::flow_ended(flow_id, "STOPPED"));
        tracing::info!(flow_id = %flow_id, "Flow cancelled");
        Ok(())
    }

    /// Current status, preferring the active registry for existence checks
    pub async fn get_flow_status(&self, flow_id: &str) -> Result<FlowStatus> {
        if self.inner.active.contains_key(flow_id) {
            return Ok(self.inner.state.load(flow_id).await?.status);
        }
        match self.inner.state.try_load(flow_id).await? {
            Some(state) => Ok(state.status),
            None => Err(FlowError::NotFound(format!("flow '{}'", flow_id))),
        }
    }

    /// Ids of currently active runs
    pub fn get_active_flows(&self) -> Vec<String> {
        self.inner.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Cancel every active run and drain the registry
    pub async fn shutdown(&self) {
        let flow_ids = self.get_active_flows();
        for flow_id in flow_ids {
            if let Err(e) = self.cancel(&flow_id).await {
                tracing::warn!(flow_id = %flow_id, error = %e, "Shutdown cancel failed");
            }
        }
    }

    fn spawn_run(&self, flow: Flow, control: ControlFlags) -> FlowHandle {
        let flow_id = flow.flow_id.clone();
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            let deadline = flow
                .configuration
                .timeout_ms
                .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));

            let state = engine.inner.state.load(&flow.flow_id).await?;
            let ctx = ExecutionContext::new(&flow.flow_id, engine.inner.events.clone())
                .with_variables(state.variables.clone())
                .with_control(control)
                .with_deadline(deadline);

            let outcome = engine.inner.manager.run(&flow, &ctx).await;

            // Keep paused runs out of the registry so resume can re-admit
            engine.inner.active.remove(&flow.flow_id);

            match outcome {
                Ok(result) => Ok(result),
                Err(error) => {
                    // Serialize the failure into state before the future
                    // completes; NotFound/Validation surface untouched.
                    if !matches!(
                        error,
                        FlowError::NotFound(_) | FlowError::Validation(_)
                    ) {
                        let exec_error = error.to_execution_error("flow-engine");
                        if let Err(record_error) = engine
                            .inner
                            .state
                            .record_error(&flow.flow_id, exec_error.clone())
                            .await
                        {
                            tracing::error!(
                                flow_id = %flow.flow_id,
                                error = %record_error,
                                "Failed to record engine error"
                            );
                        }
                        let _ = engine
                            .inner
                            .state
                            .update(
                                &flow.flow_id,
                                StateUpdate::new()
                                    .with_status(FlowStatus::Failed)
                                    .with_error(exec_error.clone()),
                            )
                            .await;
                        engine
                            .inner
                            .events
                            .emit(ArchflowEvent::flow_error(&flow.flow_id, &exec_error));
                    }
                    Err(error)
                }
            }
        });

        FlowHandle { flow_id, handle }
    }

    async fn wait_for_status<F>(&self, flow_id: &str, predicate: F) -> Result<()>
    where
        F: Fn(FlowStatus) -> bool,
    {
        // The manager reacts at its next suspension point; poll briefly.
        for _ in 0..1000 {
            let state = self.inner.state.load(flow_id).await?;
            if predicate(state.status) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Err(FlowError::Timeout {
            operation: format!("waiting for flow '{}' to settle", flow_id),
            duration_ms: 5000,
        })
    }
}
