//! # archflow-core - AI-Workflow Execution Engine
//!
//! **The execution half of archflow**: a declarative flow (a DAG of steps
//! that invoke language models, retrieval chains, agents, or tools) is
//! admitted by the [`FlowEngine`], driven by the [`ExecutionManager`] under
//! well-defined concurrency, persistence, and failure semantics, and
//! observed as a stream of typed [`ArchflowEvent`]s. Runs can be paused,
//! resumed, and cancelled cooperatively.
//!
//! ## Components
//!
//! | Component | Module | Responsibility |
//! |-----------|--------|----------------|
//! | Flow engine | [`engine`] | Admission, validation, lifecycle, active-run registry |
//! | Execution manager | [`manager`] | Walks the step DAG, sequential vs parallel regions, result folding |
//! | Parallel executor | [`parallel`] | Bounded fan-out, input-order fan-in |
//! | Deterministic executor | [`deterministic`] | Strict retry, schema validation, output formatting |
//! | Conversation manager | [`conversation`] | Suspend/resume with opaque tokens and expiry |
//! | Event streaming | [`event`] | Typed envelope + payload, subscriber fan-out |
//! | Interceptor chain | [`interceptor`] | Ordered before/after/error hooks, guardrails, cache, metrics |
//! | Step adapters | [`step`], [`tool`] | Uniform `execute(ctx)` over opaque step kinds |
//!
//! State persistence (the store, the audit log, snapshot isolation) lives in
//! the sibling `archflow-state` crate; this crate consumes it through
//! [`StateManager`](archflow_state::StateManager).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archflow_core::{
//!     AgentConfig, EventBus, Flow, FlowEngine, FlowStep, InterceptorChain, StepKind,
//!     StepExecutorRegistry, ToolRegistry, FnTool,
//! };
//! use archflow_state::InMemoryStateStore;
//! use serde_json::json;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. Register tools
//!     let mut tools = ToolRegistry::new();
//!     tools.register(Arc::new(FnTool::new("greet", |input, _ctx| async move {
//!         Ok(json!({ "greeting": format!("hello, {}", input["name"].as_str().unwrap_or("world")) }))
//!     })));
//!
//!     // 2. Wire the engine
//!     let engine = FlowEngine::new(
//!         AgentConfig::builder().max_concurrent_flows(8).build()?,
//!         Arc::new(InMemoryStateStore::new()),
//!         StepExecutorRegistry::with_tools(tools),
//!         InterceptorChain::new(),
//!         EventBus::new(),
//!     );
//!
//!     // 3. Register and start a flow
//!     engine.register_flow(
//!         Flow::new("hello").add_step(FlowStep::new("greet", StepKind::Tool)),
//!     )?;
//!     let mut input = HashMap::new();
//!     input.insert("name".to_string(), json!("archflow"));
//!
//!     let handle = engine.start_flow("hello", input).await?;
//!     let result = handle.join().await?;
//!     println!("finished: {:?} -> {:?}", result.status, result.output);
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency Model
//!
//! Parallel workers with cooperative cancellation: steps run on the tokio
//! runtime, bounded per region by a semaphore. There is no global event
//! loop; the core is thread-safe and non-reentrant at the
//! [`FlowState`](archflow_state::FlowState) granularity (per-flow update
//! serialization in the store). Pause and cancel are flags observed at
//! suspension points: between steps, between retry attempts, and at
//! parallel joins.

pub mod config;
pub mod context;
pub mod conversation;
pub mod definition;
pub mod deterministic;
pub mod engine;
pub mod error;
pub mod event;
pub mod flow;
pub mod guard;
pub mod interceptor;
pub mod manager;
pub mod parallel;
pub mod step;
pub mod tool;

pub use config::{AgentConfig, AgentConfigBuilder, MonitoringConfig, ResourceConfig};
pub use context::{ControlFlags, ControlSignal, ExecutionContext};
pub use conversation::{
    ConversationManager, ConversationStats, ConversationStatus, SuspendedConversation,
};
pub use definition::FlowDefinition;
pub use deterministic::{
    Attempt, DeterministicExecutor, ExecutionMode, ExecutionResult, OutputFormat,
};
pub use engine::{FlowEngine, FlowHandle};
pub use error::{FlowError, Result};
pub use event::{ArchflowEvent, EventBus, EventDomain, EventEnvelope, EventType};
pub use flow::{Flow, FlowConfiguration, FlowStep, RetryPolicy, StepConnection, StepKind};
pub use interceptor::{
    CacheInterceptor, GuardrailInterceptor, GuardrailRule, InterceptorChain, LoggingInterceptor,
    MetricsInterceptor, ToolExecutionContext, ToolInterceptor, ToolMetricsSnapshot,
};
pub use manager::{ExecutionManager, FlowResult};
pub use parallel::ParallelExecutor;
pub use step::{FnStepExecutor, StepExecutor, StepExecutorRegistry, ToolStepExecutor};
pub use tool::{FnTool, Tool, ToolRegistry};
