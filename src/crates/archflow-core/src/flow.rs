//! The immutable flow plan
//!
//! A [`Flow`] is a directed acyclic graph of [`FlowStep`]s joined by
//! [`StepConnection`]s, plus a [`FlowConfiguration`]. Flows are built once,
//! validated, and never mutated during execution; all run-scoped mutation
//! lives in [`FlowState`](archflow_state::FlowState).
//!
//! # Building a Flow
//!
//! ```rust
//! use archflow_core::flow::{Flow, FlowStep, StepKind};
//! use serde_json::json;
//!
//! let flow = Flow::new("pipeline")
//!     .add_step(FlowStep::new("fetch", StepKind::Tool).with_config(json!({"tool": "http"})))
//!     .add_step(FlowStep::new("summarize", StepKind::Assistant))
//!     .connect("fetch", "summarize");
//!
//! flow.validate().expect("flow is well formed");
//! ```
//!
//! Validation rejects cycles, dangling connection endpoints, duplicate step
//! ids, and steps unreachable from any source.

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// What kind of adapter executes a step
///
/// The kind selects the adapter; scheduling is oblivious to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// Single LLM call with a prompt template
    Assistant,
    /// Autonomous agent loop
    Agent,
    /// Direct tool invocation
    Tool,
    /// Retrieval or transformation chain
    Chain,
    /// Application-registered adapter
    Custom,
}

/// Directed edge between two steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConnection {
    /// Step the edge leaves
    pub source_id: String,

    /// Step the edge enters
    pub target_id: String,

    /// Guard expression; the edge fires only when it evaluates true.
    /// Absent means unconditional. Grammar: [`crate::guard`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    /// Whether this edge is followed on step failure instead of success
    #[serde(default)]
    pub error_path: bool,
}

impl StepConnection {
    /// Unconditional success edge
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            guard: None,
            error_path: false,
        }
    }

    /// Attach a guard expression
    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    /// Mark this edge as the failure route
    pub fn as_error_path(mut self) -> Self {
        self.error_path = true;
        self
    }
}

/// One node in the flow plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStep {
    /// Unique identifier within the flow
    pub id: String,

    /// Adapter kind
    pub kind: StepKind,

    /// Human-readable name; defaults to the id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Adapter-specific configuration payload
    #[serde(default)]
    pub config: Value,

    /// Outgoing edges, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<StepConnection>,
}

impl FlowStep {
    /// Step with empty configuration
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            config: Value::Null,
            connections: Vec::new(),
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the adapter configuration payload
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Backoff schedule consulted when a retryable step error occurs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff_ms: u64,

    /// Multiplier applied to the delay after each retry
    pub multiplier: f64,

    /// Cap on any single delay
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Policy with the given attempt bound and default backoff shape
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }

    /// Set the initial backoff
    pub fn with_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Set the backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the backoff cap
    pub fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Whether another attempt is allowed after `attempt` attempts were made
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-indexed)
    ///
    /// `initial_backoff * multiplier^(attempt-1)`, capped at
    /// `max_backoff_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let delay = self.initial_backoff_ms as f64 * self.multiplier.powi(exp as i32);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run-wide knobs for a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfiguration {
    /// Flow-level deadline; expiry records TIMEOUT and cancels the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Retry schedule for retryable step failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Semaphore bound for parallel regions
    pub max_concurrent_steps: usize,

    /// Parallel-region failure policy: `true` cancels the region on the
    /// first fatal error (any-fatal); `false` lets every branch finish and
    /// fails only if all failed (all-fatal)
    pub fail_fast: bool,
}

impl Default for FlowConfiguration {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            retry_policy: None,
            max_concurrent_steps: 4,
            fail_fast: true,
        }
    }
}

impl FlowConfiguration {
    /// Set the flow deadline
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set the parallel-region semaphore bound
    pub fn with_max_concurrent_steps(mut self, n: usize) -> Self {
        self.max_concurrent_steps = n;
        self
    }

    /// Set the parallel failure policy
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Immutable flow plan: steps, connections, configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Stable identity
    pub flow_id: String,

    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Steps in declaration order
    pub steps: Vec<FlowStep>,

    /// Run-wide configuration
    #[serde(default)]
    pub configuration: FlowConfiguration,
}

impl Flow {
    /// Empty flow; add steps and connections, then [`Flow::validate`]
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            name: None,
            steps: Vec::new(),
            configuration: FlowConfiguration::default(),
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the configuration
    pub fn with_configuration(mut self, configuration: FlowConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Append a step
    pub fn add_step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Add an unconditional success edge
    pub fn connect(self, source: &str, target: &str) -> Self {
        self.add_connection(StepConnection::new(source, target))
    }

    /// Add a guarded success edge
    pub fn connect_when(self, source: &str, target: &str, guard: &str) -> Self {
        self.add_connection(StepConnection::new(source, target).with_guard(guard))
    }

    /// Add an error-path edge
    pub fn connect_on_error(self, source: &str, target: &str) -> Self {
        self.add_connection(StepConnection::new(source, target).as_error_path())
    }

    /// Add an arbitrary connection
    pub fn add_connection(mut self, connection: StepConnection) -> Self {
        if let Some(step) = self
            .steps
            .iter_mut()
            .find(|s| s.id == connection.source_id)
        {
            step.connections.push(connection);
        } else {
            // Keep the dangling edge so validate() reports it instead of
            // silently dropping the caller's mistake.
            self.steps.push(FlowStep {
                id: connection.source_id.clone(),
                kind: StepKind::Custom,
                name: None,
                config: Value::Null,
                connections: vec![connection],
            });
        }
        self
    }

    /// Look up a step by id
    pub fn step(&self, id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps with no incoming connections, in declaration order
    pub fn source_steps(&self) -> Vec<&FlowStep> {
        let targets: HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.connections.iter().map(|c| c.target_id.as_str()))
            .collect();
        self.steps
            .iter()
            .filter(|s| !targets.contains(s.id.as_str()))
            .collect()
    }

    /// All connections entering `step_id`
    pub fn incoming(&self, step_id: &str) -> Vec<&StepConnection> {
        self.steps
            .iter()
            .flat_map(|s| s.connections.iter())
            .filter(|c| c.target_id == step_id)
            .collect()
    }

    /// Validate structure: unique ids, resolvable endpoints, at least one
    /// source, acyclic, and fully connected from the sources
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(FlowError::Validation(format!(
                "flow '{}' has no steps",
                self.flow_id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(FlowError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for conn in &step.connections {
                if conn.source_id != step.id {
                    return Err(FlowError::Validation(format!(
                        "connection source '{}' does not match owning step '{}'",
                        conn.source_id, step.id
                    )));
                }
                if !ids.contains(conn.target_id.as_str()) {
                    return Err(FlowError::Validation(format!(
                        "connection target '{}' does not exist",
                        conn.target_id
                    )));
                }
            }
        }

        let sources = self.source_steps();
        if sources.is_empty() {
            return Err(FlowError::Validation(format!(
                "flow '{}' has no source step (every step has an incoming connection)",
                self.flow_id
            )));
        }

        self.reject_cycles(&ids)?;
        self.reject_unreachable(&sources)?;
        Ok(())
    }

    /// Kahn's algorithm: if not every step can be peeled, a cycle exists
    fn reject_cycles(&self, ids: &HashSet<&str>) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
        for step in &self.steps {
            for conn in &step.connections {
                *in_degree.entry(conn.target_id.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut peeled = 0usize;

        while let Some(id) = queue.pop_front() {
            peeled += 1;
            if let Some(step) = self.step(id) {
                for conn in &step.connections {
                    if let Some(degree) = in_degree.get_mut(conn.target_id.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(conn.target_id.as_str());
                        }
                    }
                }
            }
        }

        if peeled != self.steps.len() {
            return Err(FlowError::Validation(format!(
                "flow '{}' contains a cycle",
                self.flow_id
            )));
        }
        Ok(())
    }

    fn reject_unreachable(&self, sources: &[&FlowStep]) -> Result<()> {
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = sources.iter().map(|s| s.id.as_str()).collect();

        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(step) = self.step(id) {
                for conn in &step.connections {
                    queue.push_back(conn.target_id.as_str());
                }
            }
        }

        for step in &self.steps {
            if !reachable.contains(step.id.as_str()) {
                return Err(FlowError::Validation(format!(
                    "step '{}' is unreachable from any source",
                    step.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear() -> Flow {
        Flow::new("lin")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("B", StepKind::Tool))
            .add_step(FlowStep::new("C", StepKind::Tool))
            .connect("A", "B")
            .connect("B", "C")
    }

    #[test]
    fn test_valid_linear_flow() {
        let flow = linear();
        flow.validate().unwrap();
        assert_eq!(flow.source_steps().len(), 1);
        assert_eq!(flow.source_steps()[0].id, "A");
        assert_eq!(flow.incoming("B").len(), 1);
    }

    #[test]
    fn test_cycle_rejected() {
        let flow = linear().connect("C", "A");
        let err = flow.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_loop_rejected() {
        let flow = Flow::new("loop")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("B", StepKind::Tool))
            .connect("A", "B")
            .connect("A", "A");
        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_dangling_target_rejected() {
        let flow = Flow::new("dangling")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .connect("A", "ghost");
        let err = flow.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let flow = Flow::new("dup")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("A", StepKind::Agent));
        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_unreachable_step_rejected() {
        // D -> E forms an island with its own source, reachable; but a
        // two-node cycle island has no source and is caught as a cycle,
        // so build an island reachable check via an empty-source case.
        let flow = Flow::new("island")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("B", StepKind::Tool))
            .add_step(FlowStep::new("C", StepKind::Tool))
            .add_step(FlowStep::new("D", StepKind::Tool))
            .connect("A", "B")
            .connect("C", "D");
        // Both islands have sources; this is valid (multi-source flow).
        flow.validate().unwrap();
        assert_eq!(flow.source_steps().len(), 2);
    }

    #[test]
    fn test_empty_flow_rejected() {
        assert!(Flow::new("empty").validate().is_err());
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::new(4)
            .with_initial_backoff_ms(100)
            .with_multiplier(2.0)
            .with_max_backoff_ms(350);

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        // 400 capped to 350
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(350));

        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_step_config_payload() {
        let step = FlowStep::new("llm", StepKind::Assistant)
            .with_name("Summarizer")
            .with_config(json!({"model": "gpt", "temperature": 0.2}));
        assert_eq!(step.config["model"], json!("gpt"));
        assert_eq!(step.name.as_deref(), Some("Summarizer"));
    }

    #[test]
    fn test_guarded_and_error_connections() {
        let flow = Flow::new("branchy")
            .add_step(FlowStep::new("A", StepKind::Tool))
            .add_step(FlowStep::new("B", StepKind::Tool))
            .add_step(FlowStep::new("ERR", StepKind::Tool))
            .connect_when("A", "B", "score > 5")
            .connect_on_error("A", "ERR");
        flow.validate().unwrap();

        let a = flow.step("A").unwrap();
        assert_eq!(a.connections[0].guard.as_deref(), Some("score > 5"));
        assert!(a.connections[1].error_path);
    }
}
