//! Declarative flow definitions
//!
//! Flows can be described as YAML or JSON documents and loaded into a
//! validated [`Flow`]. The document shape mirrors the flow model, with
//! connections written from the source step's point of view:
//!
//! ```yaml
//! flowId: support-pipeline
//! name: Support triage
//! configuration:
//!   timeoutMs: 60000
//!   maxConcurrentSteps: 2
//!   failFast: true
//!   retryPolicy:
//!     maxAttempts: 3
//!     initialBackoffMs: 250
//!     multiplier: 2.0
//!     maxBackoffMs: 5000
//! steps:
//!   - id: classify
//!     kind: ASSISTANT
//!     config:
//!       prompt: "Classify the ticket"
//!     connections:
//!       - target: escalate
//!         guard: "severity == 'high'"
//!       - target: reply
//!         guard: "severity != 'high'"
//!       - target: fallback
//!         errorPath: true
//!   - id: escalate
//!     kind: TOOL
//!     config: { tool: pagerduty }
//!   - id: reply
//!     kind: ASSISTANT
//!   - id: fallback
//!     kind: TOOL
//!     config: { tool: dead_letter }
//! ```
//!
//! [`FlowDefinition::into_flow`] validates structure (cycles, dangling
//! targets, duplicate ids) before handing back the plan.

use crate::error::Result;
use crate::flow::{Flow, FlowConfiguration, FlowStep, RetryPolicy, StepConnection, StepKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root of a declarative flow document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Stable flow identity
    pub flow_id: String,

    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Run-wide configuration
    #[serde(default)]
    pub configuration: ConfigurationDefinition,

    /// Steps with their outgoing connections
    pub steps: Vec<StepDefinition>,
}

/// Configuration section of a definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationDefinition {
    /// Flow deadline in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Parallel-region semaphore bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_steps: Option<usize>,

    /// Parallel failure policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,

    /// Retry schedule for retryable step failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicyDefinition>,
}

/// Retry section of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyDefinition {
    /// Maximum attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Multiplier applied after each retry
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Cap on any single delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

/// One step in a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique step id
    pub id: String,

    /// Adapter kind
    pub kind: StepKind,

    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Adapter configuration payload
    #[serde(default)]
    pub config: Value,

    /// Outgoing connections
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionDefinition>,
}

/// One outgoing connection in a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDefinition {
    /// Target step id
    pub target: String,

    /// Guard expression; absent means unconditional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    /// Whether this edge fires on failure instead of success
    #[serde(default)]
    pub error_path: bool,
}

impl FlowDefinition {
    /// Parse a YAML document
    pub fn from_yaml(document: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(document)?)
    }

    /// Parse a JSON document
    pub fn from_json(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    /// Build and validate the [`Flow`]
    pub fn into_flow(self) -> Result<Flow> {
        let mut configuration = FlowConfiguration::default();
        if let Some(ms) = self.configuration.timeout_ms {
            configuration.timeout_ms = Some(ms);
        }
        if let Some(n) = self.configuration.max_concurrent_steps {
            configuration.max_concurrent_steps = n;
        }
        if let Some(fail_fast) = self.configuration.fail_fast {
            configuration.fail_fast = fail_fast;
        }
        if let Some(retry) = self.configuration.retry_policy {
            configuration.retry_policy = Some(
                RetryPolicy::new(retry.max_attempts)
                    .with_initial_backoff_ms(retry.initial_backoff_ms)
                    .with_multiplier(retry.multiplier)
                    .with_max_backoff_ms(retry.max_backoff_ms),
            );
        }

        let mut flow = Flow::new(self.flow_id).with_configuration(configuration);
        if let Some(name) = self.name {
            flow = flow.with_name(name);
        }

        for step_def in self.steps {
            let mut step = FlowStep::new(&step_def.id, step_def.kind).with_config(step_def.config);
            if let Some(name) = step_def.name {
                step = step.with_name(name);
            }
            for conn in step_def.connections {
                let mut connection = StepConnection::new(&step_def.id, conn.target);
                if let Some(guard) = conn.guard {
                    connection = connection.with_guard(guard);
                }
                if conn.error_path {
                    connection = connection.as_error_path();
                }
                step.connections.push(connection);
            }
            flow = flow.add_step(step);
        }

        flow.validate()?;
        Ok(flow)
    }
}
