//! Parallel executor
//!
//! Runs a set of independent steps with bounded concurrency and collects
//! their results **in input order**, regardless of completion order.
//!
//! Contract:
//!
//! - Concurrency is bounded by a semaphore sized at construction.
//! - Every step is dispatched; the executor waits for all of them before
//!   returning (the fan-in join is a suspension point for the run).
//! - With `fail_fast`, the first fatal result cancels the region: unstarted
//!   steps return CANCELLED without running, in-flight steps observe the
//!   region's cancellation flag through their context. Collected results
//!   still cover every step so the audit trail is complete.
//! - Cancellation from above (flow cancel) propagates into each step via
//!   [`crate::context::ControlFlags::child`] linkage; the region never
//!   swallows it.

use crate::context::ExecutionContext;
use crate::flow::FlowStep;
use archflow_state::{StepResult, StepStatus};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounded fan-out executor for independent steps
#[derive(Clone)]
pub struct ParallelExecutor {
    semaphore: Arc<Semaphore>,
    fail_fast: bool,
}

impl ParallelExecutor {
    /// Executor allowing at most `max_concurrent` steps in flight
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            fail_fast: true,
        }
    }

    /// Set the region failure policy (default: fail fast)
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Run every step through `run`, returning results in input order
    ///
    /// `run` is the single-step runner the execution manager provides (it
    /// wraps the interceptor chain and the step adapter). Each step gets a
    /// context whose control flags are a child of the region's, which is
    /// itself a child of the run's.
    pub async fn execute<F, Fut>(
        &self,
        steps: Vec<FlowStep>,
        ctx: &ExecutionContext,
        run: F,
    ) -> Vec<StepResult>
    where
        F: Fn(FlowStep, ExecutionContext) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = StepResult> + Send,
    {
        let region = ctx.control().child();
        let fail_fast = self.fail_fast;

        let mut handles = Vec::with_capacity(steps.len());
        for step in steps {
            let semaphore = self.semaphore.clone();
            let region = region.clone();
            let step_ctx = ctx.clone().with_control(region.clone());
            let run = run.clone();

            handles.push(tokio::spawn(async move {
                // The permit bounds concurrency; cancellation observed while
                // queued skips the body entirely.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return StepResult::cancelled(step.id),
                };
                if region.is_cancelled() {
                    return StepResult::cancelled(step.id);
                }

                let step_id = step.id.clone();
                let result = run(step, step_ctx).await;

                if fail_fast
                    && matches!(result.status, StepStatus::Failed | StepStatus::Timeout)
                {
                    tracing::warn!(
                        step_id = %step_id,
                        "Fatal result in parallel region, cancelling remaining steps"
                    );
                    region.request_cancel();
                }
                result
            }));
        }

        // join_all preserves spawn order, so the output matches the input
        // regardless of completion order
        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Parallel step task panicked");
                    StepResult::failed(
                        "unknown",
                        archflow_state::ExecutionError::new(
                            archflow_state::ExecutionErrorType::System,
                            "STEP_TASK_PANICKED",
                            join_error.to_string(),
                        ),
                        archflow_state::StepMetrics::default(),
                    )
                }
            })
            .collect()
    }
}
