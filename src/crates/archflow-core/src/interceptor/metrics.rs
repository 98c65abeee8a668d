//! Invocation counters and duration histograms per tool

use super::{ToolExecutionContext, ToolInterceptor};
use crate::error::{FlowError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Point-in-time counters for one tool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetricsSnapshot {
    /// Total invocations (successes + failures)
    pub invocations: u64,
    /// Invocations that returned a result
    pub successes: u64,
    /// Invocations that failed or were blocked
    pub failures: u64,
    /// Sum of observed durations
    pub total_duration_ms: u64,
    /// Shortest observed duration
    pub min_duration_ms: Option<u64>,
    /// Longest observed duration
    pub max_duration_ms: Option<u64>,
}

impl ToolMetricsSnapshot {
    /// Mean duration across completed invocations
    pub fn mean_duration_ms(&self) -> Option<u64> {
        let completed = self.successes + self.failures;
        if completed == 0 {
            None
        } else {
            Some(self.total_duration_ms / completed)
        }
    }

    fn observe(&mut self, duration_ms: u64, success: bool) {
        self.invocations += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration_ms += duration_ms;
        self.min_duration_ms = Some(self.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_duration_ms = Some(self.max_duration_ms.map_or(duration_ms, |m| m.max(duration_ms)));
    }
}

/// Records per-tool invocation counters and durations
///
/// Sits close to the tool body (high order) so durations exclude the outer
/// interceptors. Snapshots are read with [`MetricsInterceptor::snapshot`].
#[derive(Clone, Default)]
pub struct MetricsInterceptor {
    metrics: Arc<Mutex<HashMap<String, ToolMetricsSnapshot>>>,
}

impl MetricsInterceptor {
    /// Interceptor with empty counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one tool
    pub fn snapshot(&self, tool_name: &str) -> ToolMetricsSnapshot {
        self.metrics
            .lock()
            .get(tool_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Counters for every tool observed so far
    pub fn snapshot_all(&self) -> HashMap<String, ToolMetricsSnapshot> {
        self.metrics.lock().clone()
    }

    fn record(&self, ctx: &ToolExecutionContext, success: bool) {
        let duration_ms = ctx
            .attributes
            .get("metrics.begin_ms")
            .and_then(Value::as_u64)
            .map(|begin| now_ms().saturating_sub(begin))
            .unwrap_or(0);
        self.metrics
            .lock()
            .entry(ctx.tool_name.clone())
            .or_default()
            .observe(duration_ms, success);
    }
}

#[async_trait]
impl ToolInterceptor for MetricsInterceptor {
    fn name(&self) -> &str {
        "metrics"
    }

    fn order(&self) -> i32 {
        1000
    }

    async fn before_execute(&self, ctx: &mut ToolExecutionContext) -> Result<()> {
        ctx.attributes
            .insert("metrics.begin_ms".to_string(), json!(now_ms()));
        Ok(())
    }

    async fn after_execute(&self, ctx: &mut ToolExecutionContext, result: Value) -> Result<Value> {
        self.record(ctx, true);
        Ok(result)
    }

    async fn on_error(&self, ctx: &ToolExecutionContext, _error: &FlowError) {
        self.record(ctx, false);
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::event::EventBus;
    use crate::interceptor::InterceptorChain;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("f", EventBus::new())
    }

    #[tokio::test]
    async fn test_counts_successes_and_failures() {
        let metrics = MetricsInterceptor::new();
        let chain = InterceptorChain::new().with(Arc::new(metrics.clone()));

        chain
            .execute("calc", json!(1), &ctx(), |input| async move { Ok(input) })
            .await
            .unwrap();
        chain
            .execute("calc", json!(1), &ctx(), |_| async move {
                Err(FlowError::step("calc", "boom"))
            })
            .await
            .unwrap_err();

        let snapshot = metrics.snapshot("calc");
        assert_eq!(snapshot.invocations, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures, 1);
        assert!(snapshot.min_duration_ms.is_some());
        assert!(snapshot.mean_duration_ms().is_some());
    }

    #[tokio::test]
    async fn test_tools_tracked_independently() {
        let metrics = MetricsInterceptor::new();
        let chain = InterceptorChain::new().with(Arc::new(metrics.clone()));

        chain
            .execute("a", json!(1), &ctx(), |input| async move { Ok(input) })
            .await
            .unwrap();
        chain
            .execute("b", json!(1), &ctx(), |input| async move { Ok(input) })
            .await
            .unwrap();

        assert_eq!(metrics.snapshot("a").invocations, 1);
        assert_eq!(metrics.snapshot("b").invocations, 1);
        assert_eq!(metrics.snapshot_all().len(), 2);
        assert_eq!(metrics.snapshot("ghost"), ToolMetricsSnapshot::default());
    }
}
