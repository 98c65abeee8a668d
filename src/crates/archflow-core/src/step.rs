//! Step adapters
//!
//! Step kinds are opaque to the scheduler: every step is invoked through
//! the same [`StepExecutor`] shape, and the kind only selects which adapter
//! handles it. The core ships a [`ToolStepExecutor`] routing TOOL steps to
//! the [`ToolRegistry`](crate::tool::ToolRegistry); assistant/agent/chain
//! adapters wrap concrete provider clients and are registered by the
//! application ([`FnStepExecutor`] covers tests and simple cases).

use crate::context::ExecutionContext;
use crate::error::{FlowError, Result};
use crate::flow::{FlowStep, StepKind};
use crate::tool::ToolRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Uniform adapter interface: input in, output value (or error) out
#[async_trait]
pub trait StepExecutor: Send + Sync + std::fmt::Debug {
    /// Run one step against its input within the run's context
    async fn execute(&self, step: &FlowStep, input: Value, ctx: &ExecutionContext)
        -> Result<Value>;
}

/// Routes TOOL steps to a registered [`Tool`](crate::tool::Tool)
///
/// The tool name comes from the step's `config.tool` field, falling back to
/// the step id.
#[derive(Debug)]
pub struct ToolStepExecutor {
    tools: ToolRegistry,
}

impl ToolStepExecutor {
    /// Adapter over the given registry
    pub fn new(tools: ToolRegistry) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl StepExecutor for ToolStepExecutor {
    async fn execute(
        &self,
        step: &FlowStep,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let tool_name = step
            .config
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or(step.id.as_str());
        let tool = self.tools.require(tool_name)?;
        tool.execute(input, ctx).await
    }
}

type StepFn = Arc<
    dyn Fn(
            FlowStep,
            Value,
            ExecutionContext,
        ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// Closure-backed adapter for tests and custom steps
pub struct FnStepExecutor {
    func: StepFn,
}

impl std::fmt::Debug for FnStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStepExecutor").finish()
    }
}

impl FnStepExecutor {
    /// Wrap an async closure as a step adapter
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(FlowStep, Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |step, input, ctx| Box::pin(func(step, input, ctx))),
        }
    }
}

#[async_trait]
impl StepExecutor for FnStepExecutor {
    async fn execute(
        &self,
        step: &FlowStep,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        (self.func)(step.clone(), input, ctx.clone()).await
    }
}

/// Kind-indexed collection of step adapters
#[derive(Clone, Default, Debug)]
pub struct StepExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl StepExecutorRegistry {
    /// Empty registry; unregistered kinds fail with CONFIGURATION
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the TOOL kind wired to the given tool registry
    pub fn with_tools(tools: ToolRegistry) -> Self {
        let mut registry = Self::new();
        registry.register(StepKind::Tool, Arc::new(ToolStepExecutor::new(tools)));
        registry
    }

    /// Register (or replace) the adapter for a kind
    pub fn register(&mut self, kind: StepKind, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(kind, executor);
    }

    /// The adapter for a kind, failing with CONFIGURATION when absent
    pub fn require(&self, kind: StepKind) -> Result<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned().ok_or_else(|| {
            FlowError::Configuration(format!("no step executor registered for kind {:?}", kind))
        })
    }

    /// Whether a kind has an adapter
    pub fn supports(&self, kind: StepKind) -> bool {
        self.executors.contains_key(&kind)
    }
}
