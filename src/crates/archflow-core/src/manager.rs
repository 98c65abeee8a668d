//! Execution manager
//!
//! Walks a flow's step DAG to completion under the run's control flags.
//! Scheduling is edge-driven:
//!
//! 1. A connection **fires** when its source step finished with the matching
//!    polarity (success edges on success, error-path edges on failure) and
//!    its guard, if any, evaluates true against the current context.
//! 2. A step is **ready** when it has no incoming connections (a source), or
//!    when every incoming connection is resolved (its source fired or can
//!    never fire) and at least one of them fired.
//! 3. A step is **dead** when every incoming connection is resolved and none
//!    fired; dead steps resolve their own outgoing edges, so unreachable
//!    regions drain instead of parking forever.
//!
//! One ready step executes sequentially on the current path; several ready
//! steps form a parallel region handed to the [`ParallelExecutor`], with
//! results folded back in deterministic (lexicographic) order. Between steps
//! the manager polls the control flags (pause/cancel) and the flow deadline.
//!
//! Two reserved variables carry scheduling state across a pause/resume
//! boundary: `_output` holds the last step output (guards read it as
//! `output`), and `_fired` maps finished step ids to their success polarity.

use crate::context::{ControlSignal, ExecutionContext};
use crate::error::{FlowError, Result};
use crate::event::ArchflowEvent;
use crate::flow::{Flow, FlowStep, StepConnection};
use crate::guard;
use crate::interceptor::InterceptorChain;
use crate::parallel::ParallelExecutor;
use crate::step::StepExecutorRegistry;
use archflow_state::{
    ExecutionError, FlowMetrics, FlowState, FlowStatus, PathOp, StateManager, StateUpdate,
    StepMetrics, StepResult, StepStatus,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Reserved variable holding the last step output
pub const VAR_LAST_OUTPUT: &str = "_output";
/// Reserved variable mapping fired step ids to success polarity
pub const VAR_FIRED: &str = "_fired";

/// Outcome of one run handed back to the engine and the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    /// Flow this result belongs to
    pub flow_id: String,

    /// Terminal (or PAUSED) status of the run
    pub status: FlowStatus,

    /// Output of the last step to complete, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Aggregated run metrics
    pub metrics: FlowMetrics,

    /// Errors recorded during the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExecutionError>,
}

impl FlowResult {
    fn from_state(state: &FlowState) -> Self {
        Self {
            flow_id: state.flow_id.clone(),
            status: state.status,
            output: state.variables.get(VAR_LAST_OUTPUT).cloned(),
            metrics: state.metrics.clone(),
            errors: state.error.clone().into_iter().collect(),
        }
    }
}

/// Drives one flow's DAG against the state manager and step adapters
#[derive(Clone)]
pub struct ExecutionManager {
    state: StateManager,
    executors: StepExecutorRegistry,
    chain: Arc<InterceptorChain>,
}

impl ExecutionManager {
    /// Manager over the given collaborators
    pub fn new(
        state: StateManager,
        executors: StepExecutorRegistry,
        chain: Arc<InterceptorChain>,
    ) -> Self {
        Self {
            state,
            executors,
            chain,
        }
    }

    /// Run `flow` to a PAUSED, STOPPED, or terminal status
    ///
    /// Expects the state to exist (the engine persists INITIALIZED state at
    /// admission). Resumable: a PAUSED state picks up where it left off
    /// using the persisted path tree and reserved variables.
    pub async fn run(&self, flow: &Flow, ctx: &ExecutionContext) -> Result<FlowResult> {
        let flow_id = flow.flow_id.as_str();
        let mut state = self.state.load(flow_id).await?;

        match state.status {
            FlowStatus::Initialized => {
                state = self
                    .state
                    .update(
                        flow_id,
                        StateUpdate::new()
                            .with_status(FlowStatus::Running)
                            .with_path_op(PathOp::StartRoot("root".to_string())),
                    )
                    .await?;
            }
            FlowStatus::Paused => {
                // A run paused before its first step has no root path yet
                let mut update = StateUpdate::new().with_status(FlowStatus::Running);
                update = if state.execution_paths.root().is_some() {
                    update.with_path_op(PathOp::SetStatus {
                        path_id: "root".to_string(),
                        status: archflow_state::PathStatus::Running,
                    })
                } else {
                    update.with_path_op(PathOp::StartRoot("root".to_string()))
                };
                state = self.state.update(flow_id, update).await?;
            }
            status if status.is_final() => {
                return Err(FlowError::InvalidState(format!(
                    "flow '{}' is already {}",
                    flow_id, status
                )));
            }
            _ => {
                return Err(FlowError::InvalidState(format!(
                    "flow '{}' is already running",
                    flow_id
                )));
            }
        }

        // Rebuild the fired map (resume support)
        let mut fired: HashMap<String, bool> = state
            .variables
            .get(VAR_FIRED)
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.as_bool().unwrap_or(true)))
                    .collect()
            })
            .unwrap_or_default();
        let mut fatal: Option<ExecutionError> = None;

        loop {
            match ctx.control().poll() {
                ControlSignal::Cancel => return self.finish_stopped(flow_id, ctx, None).await,
                ControlSignal::Pause => return self.finish_paused(flow_id, ctx).await,
                ControlSignal::Continue => {}
            }
            if ctx.check_deadline().is_err() {
                let error = ExecutionError::timeout(
                    "FLOW_TIMEOUT",
                    format!("flow '{}' exceeded its deadline", flow_id),
                )
                .with_component("execution-manager");
                return self.finish_stopped(flow_id, ctx, Some(error)).await;
            }

            let ready = self.ready_steps(flow, &state, &fired, ctx);
            if ready.is_empty() {
                break;
            }

            let results = if ready.len() == 1 {
                let step = ready[0].clone();
                vec![self.execute_step(flow, &step, ctx, &state).await]
            } else {
                // Parallel region: lexicographic dispatch order makes the
                // fold deterministic.
                let mut region: Vec<FlowStep> = ready.into_iter().cloned().collect();
                region.sort_by(|a, b| a.id.cmp(&b.id));

                let executor = ParallelExecutor::new(flow.configuration.max_concurrent_steps)
                    .with_fail_fast(flow.configuration.fail_fast);
                let runner = self.region_runner(flow.clone());
                executor.execute(region, ctx, runner).await
            };

            let parallel_region = results.len() > 1;
            let mut region_fatals = 0usize;
            let mut region_size = 0usize;

            for result in &results {
                match result.status {
                    StepStatus::Cancelled => continue,
                    StepStatus::Paused => continue,
                    _ => {}
                }
                region_size += 1;

                let success = result.is_success();
                fired.insert(result.step_id.clone(), success);

                let is_fatal = matches!(result.status, StepStatus::Failed | StepStatus::Timeout);
                let diverted = is_fatal && self.has_error_path(flow, &result.step_id);
                if is_fatal && !diverted {
                    region_fatals += 1;
                }

                state = self
                    .fold_result(flow_id, result, &fired, parallel_region)
                    .await?;

                if is_fatal && !diverted && !parallel_region {
                    fatal = fatal.or_else(|| result.primary_error().cloned());
                }
            }

            if parallel_region && region_fatals > 0 {
                let region_failed = if flow.configuration.fail_fast {
                    true
                } else {
                    region_fatals == region_size
                };
                if region_failed && fatal.is_none() {
                    fatal = results
                        .iter()
                        .find(|r| matches!(r.status, StepStatus::Failed | StepStatus::Timeout))
                        .and_then(|r| r.primary_error().cloned());
                }
            }

            // A fatal branch with no error path ends the run
            if fatal.is_some() {
                break;
            }
        }

        // A cancel observed mid-step surfaces as a failed result; the run
        // is STOPPED and that result is discarded as an outcome.
        if ctx.control().is_cancelled() {
            return self.finish_stopped(flow_id, ctx, None).await;
        }

        match fatal {
            Some(error) => self.finish_failed(flow_id, ctx, error).await,
            None => self.finish_completed(flow_id, ctx).await,
        }
    }

    /// Steps ready to run, per the edge-driven rules in the module docs
    fn ready_steps<'a>(
        &self,
        flow: &'a Flow,
        state: &FlowState,
        fired: &HashMap<String, bool>,
        ctx: &ExecutionContext,
    ) -> Vec<&'a FlowStep> {
        let last_output = state.variables.get(VAR_LAST_OUTPUT);
        let guard_ctx = guard::GuardContext::new(&state.variables).with_last_output(last_output);

        let conn_fires = |conn: &StepConnection| -> bool {
            match fired.get(conn.source_id.as_str()) {
                Some(success) => {
                    let polarity = if conn.error_path { !success } else { *success };
                    if !polarity {
                        return false;
                    }
                    match &conn.guard {
                        Some(expr) => guard::evaluate(expr, &guard_ctx).unwrap_or_else(|e| {
                            tracing::warn!(
                                flow_id = %ctx.flow_id(),
                                guard = %expr,
                                error = %e,
                                "Guard evaluation failed; treating edge as not firing"
                            );
                            false
                        }),
                        None => true,
                    }
                }
                None => false,
            }
        };

        // Dead-step fixpoint: steps whose every incoming edge is resolved
        // but none fired can never run, and resolve their own out-edges.
        let mut dead: HashSet<&str> = HashSet::new();
        loop {
            let mut changed = false;
            for step in &flow.steps {
                if fired.contains_key(step.id.as_str()) || dead.contains(step.id.as_str()) {
                    continue;
                }
                let incoming = flow.incoming(&step.id);
                if incoming.is_empty() {
                    continue;
                }
                let all_resolved = incoming.iter().all(|c| {
                    fired.contains_key(c.source_id.as_str()) || dead.contains(c.source_id.as_str())
                });
                if all_resolved && !incoming.iter().any(|c| conn_fires(c)) {
                    dead.insert(step.id.as_str());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        flow.steps
            .iter()
            .filter(|step| {
                if fired.contains_key(step.id.as_str()) || dead.contains(step.id.as_str()) {
                    return false;
                }
                let incoming = flow.incoming(&step.id);
                if incoming.is_empty() {
                    return true;
                }
                let all_resolved = incoming.iter().all(|c| {
                    fired.contains_key(c.source_id.as_str()) || dead.contains(c.source_id.as_str())
                });
                all_resolved && incoming.iter().any(|c| conn_fires(c))
            })
            .collect()
    }

    fn has_error_path(&self, flow: &Flow, step_id: &str) -> bool {
        flow.step(step_id)
            .map(|s| s.connections.iter().any(|c| c.error_path))
            .unwrap_or(false)
    }

    /// Runner closure handed to the parallel executor for a region
    fn region_runner(
        &self,
        flow: Flow,
    ) -> impl Fn(
        FlowStep,
        ExecutionContext,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StepResult> + Send>>
           + Clone
           + Send
           + 'static {
        let manager = self.clone();
        move |step, step_ctx| {
            let manager = manager.clone();
            let flow = flow.clone();
            Box::pin(async move {
                let state = match manager.state.load(&flow.flow_id).await {
                    Ok(state) => state,
                    Err(e) => {
                        return StepResult::failed(
                            step.id.clone(),
                            FlowError::from(e).to_execution_error("execution-manager"),
                            StepMetrics::started(&step.id),
                        )
                    }
                };
                manager.execute_step(&flow, &step, &step_ctx, &state).await
            })
        }
    }

    /// Execute one step through the interceptor chain with retry
    async fn execute_step(
        &self,
        flow: &Flow,
        step: &FlowStep,
        ctx: &ExecutionContext,
        state: &FlowState,
    ) -> StepResult {
        if ctx.control().is_cancelled() {
            return StepResult::cancelled(step.id.clone());
        }

        ctx.emit(ArchflowEvent::step_started(&flow.flow_id, &step.id));
        let mut metrics = StepMetrics::started(&step.id);

        // Input: previous output when present, else the variable map
        // (reserved variables stripped)
        let input = match state.variables.get(VAR_LAST_OUTPUT) {
            Some(output) => output.clone(),
            None => {
                let mut map = Map::new();
                for (k, v) in &state.variables {
                    if !k.starts_with('_') {
                        map.insert(k.clone(), v.clone());
                    }
                }
                Value::Object(map)
            }
        };

        let step_ctx = ctx
            .clone()
            .with_variables(state.variables.clone())
            .with_last_output(state.variables.get(VAR_LAST_OUTPUT).cloned());

        let policy = flow.configuration.retry_policy.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            metrics.record_attempt();

            let executor = match self.executors.require(step.kind) {
                Ok(executor) => executor,
                Err(e) => {
                    metrics.finish();
                    let error = e.to_execution_error("execution-manager");
                    ctx.emit(ArchflowEvent::step_error(
                        &flow.flow_id,
                        &step.id,
                        &error.message,
                    ));
                    return StepResult::failed(step.id.clone(), error, metrics);
                }
            };

            let outcome = self
                .chain
                .execute(&step.id, input.clone(), &step_ctx, |chain_input| {
                    let executor = executor.clone();
                    let step = step.clone();
                    let step_ctx = step_ctx.clone();
                    async move { executor.execute(&step, chain_input, &step_ctx).await }
                })
                .await;

            match outcome {
                Ok(output) => {
                    metrics.finish();
                    ctx.emit(ArchflowEvent::step_result(
                        &flow.flow_id,
                        &step.id,
                        "COMPLETED",
                    ));
                    return StepResult::completed(step.id.clone(), output, metrics);
                }
                Err(error) => {
                    let classified = error.to_execution_error("execution-manager");
                    let retry = policy
                        .as_ref()
                        .map(|p| classified.is_retryable() && p.should_retry(attempt))
                        .unwrap_or(false);

                    if retry {
                        let delay = policy
                            .as_ref()
                            .map(|p| p.backoff_delay(attempt))
                            .unwrap_or_default();
                        tracing::warn!(
                            flow_id = %flow.flow_id,
                            step_id = %step.id,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %classified,
                            "Step failed, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                        if ctx.control().is_cancelled() {
                            return StepResult::cancelled(step.id.clone());
                        }
                        continue;
                    }

                    metrics.finish();
                    ctx.emit(ArchflowEvent::step_error(
                        &flow.flow_id,
                        &step.id,
                        &classified.message,
                    ));
                    if classified.error_type == archflow_state::ExecutionErrorType::Timeout {
                        return StepResult::timed_out(step.id.clone(), classified, metrics);
                    }
                    return StepResult::failed(step.id.clone(), classified, metrics);
                }
            }
        }
    }

    /// Persist one step result: variables from output, metrics, paths,
    /// reserved bookkeeping
    async fn fold_result(
        &self,
        flow_id: &str,
        result: &StepResult,
        fired: &HashMap<String, bool>,
        parallel_region: bool,
    ) -> Result<FlowState> {
        let mut update = StateUpdate::new()
            .with_current_step(result.step_id.clone())
            .with_step_result(result.clone());

        if let Some(output) = &result.output {
            if let Some(map) = output.as_object() {
                for (k, v) in map {
                    update = update.with_variable(k.clone(), v.clone());
                }
            } else {
                update = update.with_variable(result.step_id.clone(), output.clone());
            }
            update = update.with_variable(VAR_LAST_OUTPUT, output.clone());
        }

        let fired_map: Map<String, Value> = fired
            .iter()
            .map(|(k, v)| (k.clone(), Value::Bool(*v)))
            .collect();
        update = update.with_variable(VAR_FIRED, Value::Object(fired_map));

        // Sequential steps land on the root path; parallel branches get a
        // child path that is folded (merged) immediately after the step.
        if parallel_region {
            let child = format!("root/{}", result.step_id);
            update = update
                .with_path_op(PathOp::SpawnChild {
                    parent: "root".to_string(),
                    path_id: child.clone(),
                })
                .with_path_op(PathOp::RecordStep {
                    path_id: child.clone(),
                    step_id: result.step_id.clone(),
                });
            update = if result.is_success() {
                update.with_path_op(PathOp::Merge(child))
            } else {
                update.with_path_op(PathOp::Fail(child))
            };
        } else if result.is_success() {
            update = update.with_path_op(PathOp::RecordStep {
                path_id: "root".to_string(),
                step_id: result.step_id.clone(),
            });
        }

        if let Some(error) = result.primary_error() {
            self.state.store().save_error(flow_id, error.clone()).await?;
        }

        Ok(self.state.update(flow_id, update).await?)
    }

    async fn finish_completed(&self, flow_id: &str, ctx: &ExecutionContext) -> Result<FlowResult> {
        let state = self
            .state
            .update(
                flow_id,
                StateUpdate::new()
                    .with_status(FlowStatus::Completed)
                    .with_path_op(PathOp::Complete("root".to_string())),
            )
            .await?;
        ctx.emit(ArchflowEvent::flow_ended(flow_id, "COMPLETED"));
        tracing::info!(flow_id = %flow_id, "Flow completed");
        Ok(FlowResult::from_state(&state))
    }

    async fn finish_failed(
        &self,
        flow_id: &str,
        ctx: &ExecutionContext,
        error: ExecutionError,
    ) -> Result<FlowResult> {
        self.state.store().save_error(flow_id, error.clone()).await?;
        let state = self
            .state
            .update(
                flow_id,
                StateUpdate::new()
                    .with_status(FlowStatus::Failed)
                    .with_error(error.clone())
                    .with_path_op(PathOp::Fail("root".to_string())),
            )
            .await?;
        ctx.emit(ArchflowEvent::flow_error(flow_id, &error));
        tracing::warn!(flow_id = %flow_id, error = %error, "Flow failed");
        Ok(FlowResult::from_state(&state))
    }

    async fn finish_paused(&self, flow_id: &str, ctx: &ExecutionContext) -> Result<FlowResult> {
        let state = self
            .state
            .update(
                flow_id,
                StateUpdate::new().with_status(FlowStatus::Paused).with_path_op(
                    PathOp::SetStatus {
                        path_id: "root".to_string(),
                        status: archflow_state::PathStatus::Paused,
                    },
                ),
            )
            .await?;
        self.state.audit(&state).await?;
        ctx.emit(ArchflowEvent::new(
            crate::event::EventDomain::Audit,
            crate::event::EventType::Log,
            json!({ "flowId": flow_id, "status": "PAUSED" }),
        ));
        tracing::info!(flow_id = %flow_id, "Flow paused at step boundary");
        Ok(FlowResult::from_state(&state))
    }

    async fn finish_stopped(
        &self,
        flow_id: &str,
        ctx: &ExecutionContext,
        timeout_error: Option<ExecutionError>,
    ) -> Result<FlowResult> {
        let mut update = StateUpdate::new().with_status(FlowStatus::Stopped);
        if let Some(error) = &timeout_error {
            self.state.store().save_error(flow_id, error.clone()).await?;
            update = update.with_error(error.clone());
        }
        let state = self.state.update(flow_id, update).await?;
        self.state.audit(&state).await?;
        ctx.emit(ArchflowEvent::flow_ended(flow_id, "STOPPED"));
        tracing::info!(
            flow_id = %flow_id,
            timed_out = timeout_error.is_some(),
            "Flow stopped"
        );
        Ok(FlowResult::from_state(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::flow::StepKind;
    use crate::tool::{FnTool, ToolRegistry};
    use archflow_state::InMemoryStateStore;
    use std::collections::HashMap as StdHashMap;

    fn harness(tools: ToolRegistry) -> (ExecutionManager, StateManager, EventBus) {
        let state = StateManager::new(Arc::new(InMemoryStateStore::new()));
        let executors = StepExecutorRegistry::with_tools(tools);
        let manager = ExecutionManager::new(
            state.clone(),
            executors,
            Arc::new(InterceptorChain::new()),
        );
        (manager, state, EventBus::new())
    }

    async fn seed(state: &StateManager, flow: &Flow, input: StdHashMap<String, Value>) {
        let mut flow_state = FlowState::new(&flow.flow_id, input);
        flow_state.metrics = FlowMetrics::started(flow.steps.len());
        state.save(&flow_state).await.unwrap();
    }

    fn set_tool(tools: &mut ToolRegistry, name: &str, updates: Value) {
        let updates_clone = updates.clone();
        tools.register(Arc::new(FnTool::new(name, move |_input, _ctx| {
            let updates = updates_clone.clone();
            async move { Ok(updates) }
        })));
    }

    #[tokio::test]
    async fn test_linear_flow_runs_to_completion() {
        let mut tools = ToolRegistry::new();
        set_tool(&mut tools, "A", json!({"y": 2}));
        set_tool(&mut tools, "B", json!({"z": 3}));
        tools.register(Arc::new(FnTool::new("C", |_input, ctx| {
            let sum = ["x", "y", "z"]
                .iter()
                .map(|k| ctx.variable(k).and_then(Value::as_i64).unwrap_or(0))
                .sum::<i64>();
            async move { Ok(json!(sum)) }
        })));

        let flow = Flow::new("s1")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("B", StepKind::Tool))
            .add_step(FlowStep::new("C", StepKind::Tool))
            .connect("A", "B")
            .connect("B", "C");

        let (manager, state, events) = harness(tools);
        let mut input = StdHashMap::new();
        input.insert("x".to_string(), json!(1));
        seed(&state, &flow, input).await;

        let ctx = ExecutionContext::new("s1", events);
        let result = manager.run(&flow, &ctx).await.unwrap();

        assert_eq!(result.status, FlowStatus::Completed);
        assert_eq!(result.output, Some(json!(6)));
        assert_eq!(result.metrics.completed_steps, 3);

        let logs = state.audit_logs("s1").await.unwrap();
        assert!(logs.len() >= 4);
    }

    #[tokio::test]
    async fn test_guard_selects_branch_and_other_drains() {
        let mut tools = ToolRegistry::new();
        set_tool(&mut tools, "A", json!({"score": 9}));
        set_tool(&mut tools, "HIGH", json!({"route": "high"}));
        set_tool(&mut tools, "LOW", json!({"route": "low"}));

        let flow = Flow::new("branch")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("HIGH", StepKind::Tool))
            .add_step(FlowStep::new("LOW", StepKind::Tool))
            .connect_when("A", "HIGH", "score > 5")
            .connect_when("A", "LOW", "score <= 5");

        let (manager, state, events) = harness(tools);
        seed(&state, &flow, StdHashMap::new()).await;

        let ctx = ExecutionContext::new("branch", events);
        let result = manager.run(&flow, &ctx).await.unwrap();

        assert_eq!(result.status, FlowStatus::Completed);
        let final_state = state.load("branch").await.unwrap();
        assert_eq!(final_state.variable("route"), Some(&json!("high")));
        // LOW never ran
        assert_eq!(final_state.metrics.completed_steps, 2);
    }

    #[tokio::test]
    async fn test_error_path_diverts_failure() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FnTool::new("FAILING", |_input, _ctx| async {
            Err(FlowError::step("FAILING", "expected failure"))
        })));
        set_tool(&mut tools, "RECOVER", json!({"recovered": true}));

        let flow = Flow::new("errpath")
            .add_step(FlowStep::new("FAILING", StepKind::Tool))
            .add_step(FlowStep::new("RECOVER", StepKind::Tool))
            .connect_on_error("FAILING", "RECOVER");

        let (manager, state, events) = harness(tools);
        seed(&state, &flow, StdHashMap::new()).await;

        let ctx = ExecutionContext::new("errpath", events);
        let result = manager.run(&flow, &ctx).await.unwrap();

        assert_eq!(result.status, FlowStatus::Completed);
        let final_state = state.load("errpath").await.unwrap();
        assert_eq!(final_state.variable("recovered"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_failure_without_error_path_fails_flow() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FnTool::new("BAD", |_input, _ctx| async {
            Err(FlowError::step("BAD", "boom"))
        })));
        set_tool(&mut tools, "NEXT", json!({}));

        let flow = Flow::new("fails")
            .add_step(FlowStep::new("BAD", StepKind::Tool))
            .add_step(FlowStep::new("NEXT", StepKind::Tool))
            .connect("BAD", "NEXT");

        let (manager, state, events) = harness(tools);
        seed(&state, &flow, StdHashMap::new()).await;

        let ctx = ExecutionContext::new("fails", events);
        let result = manager.run(&flow, &ctx).await.unwrap();

        assert_eq!(result.status, FlowStatus::Failed);
        assert!(!result.errors.is_empty());
        assert!(!state.errors("fails").await.unwrap().is_empty());
        // NEXT never ran
        let final_state = state.load("fails").await.unwrap();
        assert_eq!(final_state.metrics.completed_steps, 1);
    }

    #[tokio::test]
    async fn test_retry_policy_applied_to_retryable_step_errors() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));

        let mut tools = ToolRegistry::new();
        let counter = calls.clone();
        tools.register(Arc::new(FnTool::new("FLAKY", move |_input, _ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FlowError::step("FLAKY", "transient"))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        })));

        let flow = Flow::new("flaky")
            .add_step(FlowStep::new("FLAKY", StepKind::Tool))
            .with_configuration(
                crate::flow::FlowConfiguration::default().with_retry_policy(
                    crate::flow::RetryPolicy::new(3).with_initial_backoff_ms(1),
                ),
            );

        let (manager, state, events) = harness(tools);
        seed(&state, &flow, StdHashMap::new()).await;

        let ctx = ExecutionContext::new("flaky", events);
        let result = manager.run(&flow, &ctx).await.unwrap();

        assert_eq!(result.status, FlowStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let final_state = state.load("flaky").await.unwrap();
        assert_eq!(final_state.metrics.step_metrics["FLAKY"].attempts, 3);
    }

    #[tokio::test]
    async fn test_parallel_fan_out_and_join() {
        let mut tools = ToolRegistry::new();
        set_tool(&mut tools, "A", json!({"seed": 1}));
        set_tool(&mut tools, "B", json!({"b": 1}));
        set_tool(&mut tools, "C", json!({"c": 2}));
        set_tool(&mut tools, "D", json!({"d": 3}));
        tools.register(Arc::new(FnTool::new("E", |_input, ctx| {
            let sum = ["b", "c", "d"]
                .iter()
                .map(|k| ctx.variable(k).and_then(Value::as_i64).unwrap_or(0))
                .sum::<i64>();
            async move { Ok(json!({"total": sum})) }
        })));

        let flow = Flow::new("s2")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("B", StepKind::Tool))
            .add_step(FlowStep::new("C", StepKind::Tool))
            .add_step(FlowStep::new("D", StepKind::Tool))
            .add_step(FlowStep::new("E", StepKind::Tool))
            .connect("A", "B")
            .connect("A", "C")
            .connect("A", "D")
            .connect("B", "E")
            .connect("C", "E")
            .connect("D", "E");

        let (manager, state, events) = harness(tools);
        seed(&state, &flow, StdHashMap::new()).await;

        let ctx = ExecutionContext::new("s2", events);
        let result = manager.run(&flow, &ctx).await.unwrap();

        assert_eq!(result.status, FlowStatus::Completed);
        let final_state = state.load("s2").await.unwrap();
        assert_eq!(final_state.variable("total"), Some(&json!(6)));
        assert_eq!(final_state.metrics.completed_steps, 5);

        // Parallel branches got child paths, merged at the join
        assert!(final_state.execution_paths.node("root/B").is_some());
        assert_eq!(
            final_state.execution_paths.node("root/C").unwrap().status,
            archflow_state::PathStatus::Merged
        );
    }

    #[tokio::test]
    async fn test_pause_between_steps() {
        let mut tools = ToolRegistry::new();
        set_tool(&mut tools, "A", json!({"y": 2}));
        set_tool(&mut tools, "B", json!({"z": 3}));

        let flow = Flow::new("s4")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("B", StepKind::Tool))
            .connect("A", "B");

        let (manager, state, events) = harness(tools);
        seed(&state, &flow, StdHashMap::new()).await;

        // Pause is requested before the run starts its second iteration;
        // with the flag pre-set, nothing at all runs.
        let ctx = ExecutionContext::new("s4", events);
        ctx.control().request_pause();
        let result = manager.run(&flow, &ctx).await.unwrap();
        assert_eq!(result.status, FlowStatus::Paused);

        let paused = state.load("s4").await.unwrap();
        assert_eq!(paused.metrics.completed_steps, 0);

        // Resume and run to completion
        ctx.control().clear_pause();
        let result = manager.run(&flow, &ctx).await.unwrap();
        assert_eq!(result.status, FlowStatus::Completed);
        let final_state = state.load("s4").await.unwrap();
        assert_eq!(final_state.variable("y"), Some(&json!(2)));
        assert_eq!(final_state.variable("z"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_cancel_stops_promptly() {
        let mut tools = ToolRegistry::new();
        set_tool(&mut tools, "A", json!({}));

        let flow = Flow::new("cancelme")
            .add_step(FlowStep::new("A", StepKind::Tool));

        let (manager, state, events) = harness(tools);
        seed(&state, &flow, StdHashMap::new()).await;

        let ctx = ExecutionContext::new("cancelme", events);
        ctx.control().request_cancel();
        let result = manager.run(&flow, &ctx).await.unwrap();

        assert_eq!(result.status, FlowStatus::Stopped);
        assert_eq!(state.load("cancelme").await.unwrap().metrics.completed_steps, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_deadline_records_timeout() {
        let mut tools = ToolRegistry::new();
        set_tool(&mut tools, "A", json!({}));

        let flow = Flow::new("deadline")
            .add_step(FlowStep::new("A", StepKind::Tool));

        let (manager, state, events) = harness(tools);
        seed(&state, &flow, StdHashMap::new()).await;

        let ctx = ExecutionContext::new("deadline", events)
            .with_deadline(Some(tokio::time::Instant::now()));
        tokio::time::advance(std::time::Duration::from_millis(1)).await;

        let result = manager.run(&flow, &ctx).await.unwrap();
        assert_eq!(result.status, FlowStatus::Stopped);
        let errors = state.errors("deadline").await.unwrap();
        assert_eq!(
            errors[0].error_type,
            archflow_state::ExecutionErrorType::Timeout
        );
    }
}
