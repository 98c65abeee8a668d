//! Tools and the tool registry
//!
//! A [`Tool`] is the uniform capability the engine invokes for external
//! work: LLM calls, retrieval, HTTP, calculators. Concrete provider clients
//! live outside the core; they plug in by implementing this trait (or by
//! wrapping a closure with [`FnTool`]) and registering with a
//! [`ToolRegistry`]. Invocations are routed through the interceptor chain
//! ([`crate::interceptor`]), never called directly by the execution manager.

use crate::context::ExecutionContext;
use crate::error::{FlowError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A uniformly-invocable unit of external work
#[async_trait]
pub trait Tool: Send + Sync + std::fmt::Debug {
    /// Registry key
    fn name(&self) -> &str;

    /// One-line description for diagnostics
    fn description(&self) -> &str {
        ""
    }

    /// Run the tool against `input` within the run's context
    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<Value>;
}

type ToolFn = Arc<
    dyn Fn(Value, ExecutionContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// Closure-backed [`Tool`] for tests and lightweight registrations
pub struct FnTool {
    name: String,
    description: String,
    func: ToolFn,
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl FnTool {
    /// Wrap an async closure as a tool
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            func: Arc::new(move |input, ctx| Box::pin(func(input, ctx))),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        (self.func)(input, ctx.clone()).await
    }
}

/// Name-indexed collection of tools
#[derive(Clone, Default, Debug)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name; replaces an existing entry
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Look up a tool, failing with NOT_FOUND
    pub fn require(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.get(name)
            .ok_or_else(|| FlowError::NotFound(format!("tool '{}'", name)))
    }

    /// Whether a tool is registered
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, unsorted
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}
