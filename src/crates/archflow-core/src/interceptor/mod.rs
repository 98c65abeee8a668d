//! Tool interceptor chain
//!
//! Every tool invocation runs inside an ordered onion of interceptors:
//!
//! ```text
//!  beforeExecute: ascending order            afterExecute: descending order
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │ logging (MIN+100)                                            │
//!  │   ┌──────────────────────────────────────────────────┐       │
//!  │   │ guardrails                                       │       │
//!  │   │   ┌──────────────────────────────────────┐       │       │
//!  │   │   │ metrics                              │       │       │
//!  │   │   │   ┌──────────────────────────┐       │       │       │
//!  │   │   │   │ cache    ── hit? ──────► │ skips the tool body   │
//!  │   │   │   │     tool body            │       │       │       │
//!  │   │   │   └──────────────────────────┘       │       │       │
//!  │   │   └──────────────────────────────────────┘       │       │
//!  │   └──────────────────────────────────────────────────┘       │
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Contract (held by [`InterceptorChain::execute`]):
//!
//! - `before_execute` runs in ascending [`ToolInterceptor::order`]; it may
//!   fail to block the invocation, or short-circuit with a replacement
//!   result (cache hits).
//! - For every `before_execute` that returned normally, exactly one of
//!   `after_execute` or `on_error` runs, in reverse order.
//! - `on_error` is side-effect only; it cannot alter the outcome.

mod cache;
mod guardrail;
mod logging;
mod metrics;

pub use cache::CacheInterceptor;
pub use guardrail::{GuardrailInterceptor, GuardrailRule};
pub use logging::LoggingInterceptor;
pub use metrics::{MetricsInterceptor, ToolMetricsSnapshot};

use crate::context::ExecutionContext;
use crate::error::{FlowError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Mutable state threaded through one intercepted invocation
#[derive(Debug)]
pub struct ToolExecutionContext {
    /// Tool (or step) being invoked
    pub tool_name: String,

    /// Input payload; `before_execute` may rewrite it
    pub input: Value,

    /// Flow the invocation belongs to
    pub flow_id: String,

    /// Execution id of the run
    pub execution_id: String,

    /// Replacement result set by an interceptor to skip the tool body
    pub short_circuit: Option<Value>,

    /// Scratch space shared between an interceptor's own hooks
    pub attributes: HashMap<String, Value>,
}

impl ToolExecutionContext {
    fn new(tool_name: &str, input: Value, ctx: &ExecutionContext) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            input,
            flow_id: ctx.flow_id().to_string(),
            execution_id: ctx.execution_id().to_string(),
            short_circuit: None,
            attributes: HashMap::new(),
        }
    }
}

/// One layer of the onion around a tool invocation
#[async_trait]
pub trait ToolInterceptor: Send + Sync {
    /// Name for diagnostics
    fn name(&self) -> &str;

    /// Total order; lower runs first on the way in
    fn order(&self) -> i32;

    /// Runs before the tool body, ascending order. Failing blocks the
    /// invocation; setting `ctx.short_circuit` skips the body (and any
    /// deeper interceptors) with the given result.
    async fn before_execute(&self, _ctx: &mut ToolExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Runs after a successful body, descending order; may transform the
    /// result. Must not swallow a failure unless replacing it with a
    /// clearly-labelled success.
    async fn after_execute(&self, _ctx: &mut ToolExecutionContext, result: Value) -> Result<Value> {
        Ok(result)
    }

    /// Runs when the body or a deeper interceptor failed, descending order.
    /// Side-effect only; it cannot rethrow or alter the outcome.
    async fn on_error(&self, _ctx: &ToolExecutionContext, _error: &FlowError) {}
}

/// Ordered chain of interceptors around tool invocations
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn ToolInterceptor>>,
}

impl InterceptorChain {
    /// Empty chain; invocations pass straight through
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interceptor; the chain re-sorts by [`ToolInterceptor::order`]
    pub fn with(mut self, interceptor: Arc<dyn ToolInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self.interceptors.sort_by_key(|i| i.order());
        self
    }

    /// Number of interceptors installed
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `body` inside the chain
    ///
    /// `body` receives the (possibly rewritten) input. The chain upholds
    /// interceptor symmetry: every interceptor whose `before_execute`
    /// returned normally sees exactly one of `after_execute` or `on_error`,
    /// in reverse order.
    pub async fn execute<F, Fut>(
        &self,
        tool_name: &str,
        input: Value,
        ctx: &ExecutionContext,
        body: F,
    ) -> Result<Value>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let mut tctx = ToolExecutionContext::new(tool_name, input, ctx);
        let mut entered = 0usize;

        for interceptor in &self.interceptors {
            match interceptor.before_execute(&mut tctx).await {
                Ok(()) => {
                    entered += 1;
                    if tctx.short_circuit.is_some() {
                        break;
                    }
                }
                Err(error) => {
                    // The failing hook did not return normally, so only the
                    // interceptors already entered get on_error.
                    self.unwind_error(&tctx, &error, entered).await;
                    return Err(error);
                }
            }
        }

        let outcome = match tctx.short_circuit.take() {
            Some(result) => Ok(result),
            None => body(tctx.input.clone()).await,
        };

        match outcome {
            Ok(mut result) => {
                for interceptor in self.interceptors[..entered].iter().rev() {
                    match interceptor.after_execute(&mut tctx, result).await {
                        Ok(transformed) => result = transformed,
                        Err(error) => {
                            // Interceptors deeper than this one already ran
                            // after_execute; the rest see on_error.
                            let remaining = self.interceptors[..entered]
                                .iter()
                                .rev()
                                .skip_while(|i| !Arc::ptr_eq(*i, interceptor))
                                .skip(1);
                            for outer in remaining {
                                outer.on_error(&tctx, &error).await;
                            }
                            return Err(error);
                        }
                    }
                }
                Ok(result)
            }
            Err(error) => {
                self.unwind_error(&tctx, &error, entered).await;
                Err(error)
            }
        }
    }

    async fn unwind_error(&self, tctx: &ToolExecutionContext, error: &FlowError, entered: usize) {
        for interceptor in self.interceptors[..entered].iter().rev() {
            interceptor.on_error(tctx, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("f", EventBus::new())
    }

    /// Records hook invocations into a shared trace for order assertions
    struct Tracer {
        label: &'static str,
        order: i32,
        trace: Arc<Mutex<Vec<String>>>,
        fail_before: bool,
    }

    #[async_trait]
    impl ToolInterceptor for Tracer {
        fn name(&self) -> &str {
            self.label
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn before_execute(&self, _ctx: &mut ToolExecutionContext) -> Result<()> {
            self.trace
                .lock()
                .unwrap()
                .push(format!("before:{}", self.label));
            if self.fail_before {
                return Err(FlowError::Validation(format!("{} blocked", self.label)));
            }
            Ok(())
        }

        async fn after_execute(
            &self,
            _ctx: &mut ToolExecutionContext,
            result: Value,
        ) -> Result<Value> {
            self.trace
                .lock()
                .unwrap()
                .push(format!("after:{}", self.label));
            Ok(result)
        }

        async fn on_error(&self, _ctx: &ToolExecutionContext, _error: &FlowError) {
            self.trace
                .lock()
                .unwrap()
                .push(format!("error:{}", self.label));
        }
    }

    fn tracer(
        label: &'static str,
        order: i32,
        trace: &Arc<Mutex<Vec<String>>>,
        fail_before: bool,
    ) -> Arc<dyn ToolInterceptor> {
        Arc::new(Tracer {
            label,
            order,
            trace: trace.clone(),
            fail_before,
        })
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new()
            .with(tracer("outer", 10, &trace, false))
            .with(tracer("inner", 20, &trace, false));

        let result = chain
            .execute("t", json!(1), &ctx(), |input| async move { Ok(input) })
            .await
            .unwrap();
        assert_eq!(result, json!(1));

        let trace = trace.lock().unwrap();
        assert_eq!(
            *trace,
            vec!["before:outer", "before:inner", "after:inner", "after:outer"]
        );
    }

    #[tokio::test]
    async fn test_registration_order_does_not_matter() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        // Registered inner-first; order() still decides
        let chain = InterceptorChain::new()
            .with(tracer("inner", 20, &trace, false))
            .with(tracer("outer", 10, &trace, false));

        chain
            .execute("t", json!(1), &ctx(), |input| async move { Ok(input) })
            .await
            .unwrap();

        assert_eq!(trace.lock().unwrap()[0], "before:outer");
    }

    #[tokio::test]
    async fn test_body_failure_runs_on_error_in_reverse() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new()
            .with(tracer("outer", 10, &trace, false))
            .with(tracer("inner", 20, &trace, false));

        let result = chain
            .execute("t", json!(1), &ctx(), |_| async move {
                Err(FlowError::step("t", "boom"))
            })
            .await;
        assert!(result.is_err());

        let trace = trace.lock().unwrap();
        assert_eq!(
            *trace,
            vec!["before:outer", "before:inner", "error:inner", "error:outer"]
        );
    }

    #[tokio::test]
    async fn test_blocking_before_skips_body_and_unwinds_started_only() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new()
            .with(tracer("outer", 10, &trace, false))
            .with(tracer("blocker", 20, &trace, true))
            .with(tracer("never", 30, &trace, false));

        let body_ran = Arc::new(AtomicUsize::new(0));
        let body_counter = body_ran.clone();
        let result = chain
            .execute("t", json!(1), &ctx(), |input| async move {
                body_counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            })
            .await;

        assert!(result.is_err());
        assert_eq!(body_ran.load(Ordering::SeqCst), 0);

        let trace = trace.lock().unwrap();
        // The blocker's before did not return normally: only "outer" (which
        // entered) sees on_error, exactly once.
        assert_eq!(
            *trace,
            vec!["before:outer", "before:blocker", "error:outer"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_body_and_deeper_interceptors() {
        struct ShortCircuit;

        #[async_trait]
        impl ToolInterceptor for ShortCircuit {
            fn name(&self) -> &str {
                "short"
            }
            fn order(&self) -> i32 {
                15
            }
            async fn before_execute(&self, ctx: &mut ToolExecutionContext) -> Result<()> {
                ctx.short_circuit = Some(json!("cached"));
                Ok(())
            }
        }

        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new()
            .with(tracer("outer", 10, &trace, false))
            .with(Arc::new(ShortCircuit))
            .with(tracer("deeper", 20, &trace, false));

        let result = chain
            .execute("t", json!(1), &ctx(), |_| async move {
                panic!("body must not run")
            })
            .await
            .unwrap();

        assert_eq!(result, json!("cached"));
        let trace = trace.lock().unwrap();
        // "deeper" never entered, so it sees neither after nor error
        assert_eq!(*trace, vec!["before:outer", "after:outer"]);
    }

    #[tokio::test]
    async fn test_after_execute_can_transform() {
        struct Doubler;

        #[async_trait]
        impl ToolInterceptor for Doubler {
            fn name(&self) -> &str {
                "doubler"
            }
            fn order(&self) -> i32 {
                0
            }
            async fn after_execute(
                &self,
                _ctx: &mut ToolExecutionContext,
                result: Value,
            ) -> Result<Value> {
                Ok(json!(result.as_i64().unwrap_or(0) * 2))
            }
        }

        let chain = InterceptorChain::new().with(Arc::new(Doubler));
        let result = chain
            .execute("t", json!(0), &ctx(), |_| async move { Ok(json!(21)) })
            .await
            .unwrap();
        assert_eq!(result, json!(42));
    }
}
