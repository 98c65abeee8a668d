//! Per-run execution context
//!
//! An [`ExecutionContext`] is the view of a run handed to step adapters and
//! tools: a snapshot of the variables, the last step output, the shared
//! [`ControlFlags`] for cooperative pause/cancel, the event bus, and the
//! flow deadline. The execution manager rebuilds the snapshot between steps
//! from [`FlowState`](archflow_state::FlowState); adapters never see the
//! state itself.
//!
//! Control flow is cooperative: [`ControlFlags::poll`] is checked by the
//! engine at every suspension point (between steps, between retry attempts,
//! at parallel joins), and long-running adapters are expected to check
//! [`ExecutionContext::is_cancelled`] around their own IO.

use crate::error::{FlowError, Result};
use crate::event::{ArchflowEvent, EventBus};
use crate::guard::GuardContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// What the engine should do at the next suspension point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Keep going
    Continue,
    /// Halt at the next safe point and snapshot
    Pause,
    /// Terminate cooperatively; results of in-flight work are discarded
    Cancel,
}

/// Shared pause/cancel flags for one run
///
/// Clones share the same flags. Both requests are idempotent; cancel wins
/// over pause when both are set.
#[derive(Clone, Default)]
pub struct ControlFlags {
    inner: Arc<Flags>,
}

#[derive(Default)]
struct Flags {
    cancel: AtomicBool,
    pause: AtomicBool,
    parent: Option<Arc<Flags>>,
}

impl Flags {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
            || self.parent.as_ref().map(|p| p.cancelled()).unwrap_or(false)
    }

    fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .map(|p| p.pause_requested())
                .unwrap_or(false)
    }
}

impl ControlFlags {
    /// Fresh flags with nothing requested
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags scoped under `self`: a cancel on either level is observed, but
    /// cancelling the child leaves the parent untouched. Parallel regions
    /// use this so fail-fast kills the region, not the run.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Flags {
                cancel: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Request cooperative cancellation; idempotent
    pub fn request_cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    /// Request a pause at the next safe point; idempotent
    pub fn request_pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Clear a pause request (on resume)
    pub fn clear_pause(&self) {
        self.inner.pause.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested at this level or above
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled()
    }

    /// Whether a pause has been requested at this level or above
    pub fn is_pause_requested(&self) -> bool {
        self.inner.pause_requested()
    }

    /// The signal to act on at a suspension point; cancel wins
    pub fn poll(&self) -> ControlSignal {
        if self.is_cancelled() {
            ControlSignal::Cancel
        } else if self.is_pause_requested() {
            ControlSignal::Pause
        } else {
            ControlSignal::Continue
        }
    }
}

/// The view of a run handed to step adapters and tools
#[derive(Clone)]
pub struct ExecutionContext {
    flow_id: String,
    execution_id: String,
    variables: HashMap<String, Value>,
    last_output: Option<Value>,
    control: ControlFlags,
    events: EventBus,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    /// Context for a new run with a fresh execution id
    pub fn new(flow_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            flow_id: flow_id.into(),
            execution_id: Uuid::new_v4().to_string(),
            variables: HashMap::new(),
            last_output: None,
            control: ControlFlags::new(),
            events,
            deadline: None,
        }
    }

    /// Replace the variable snapshot
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Set the last step output
    pub fn with_last_output(mut self, output: Option<Value>) -> Self {
        self.last_output = output;
        self
    }

    /// Share existing control flags (pause/cancel reach into this context)
    pub fn with_control(mut self, control: ControlFlags) -> Self {
        self.control = control;
        self
    }

    /// Pin the flow deadline
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Keep a caller-provided execution id (resume paths)
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    /// Flow this context belongs to
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Opaque id for this execution
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Read one variable
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// The full variable snapshot
    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Output of the previous step, if any
    pub fn last_output(&self) -> Option<&Value> {
        self.last_output.as_ref()
    }

    /// The shared control flags
    pub fn control(&self) -> &ControlFlags {
        &self.control
    }

    /// Whether cancellation has been requested; adapters should check this
    /// around their own IO
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// View for guard evaluation
    pub fn guard_context(&self) -> GuardContext<'_> {
        GuardContext::new(&self.variables).with_last_output(self.last_output.as_ref())
    }

    /// Emit an event, stamping correlation and execution ids when absent
    pub fn emit(&self, mut event: ArchflowEvent) {
        if event.envelope.correlation_id.is_none() {
            event.envelope.correlation_id = Some(self.flow_id.clone());
        }
        if event.envelope.execution_id.is_none() {
            event.envelope.execution_id = Some(self.execution_id.clone());
        }
        self.events.emit(event);
    }

    /// The bus itself, for components that emit on their own schedule
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Time left before the flow deadline; `None` when no deadline is set
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail with TIMEOUT when the flow deadline has passed
    pub fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(FlowError::Timeout {
                    operation: format!("flow '{}'", self.flow_id),
                    duration_ms: 0,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDomain, EventType};
    use serde_json::json;

    #[test]
    fn test_control_flags_shared_across_clones() {
        let flags = ControlFlags::new();
        let clone = flags.clone();

        assert_eq!(flags.poll(), ControlSignal::Continue);
        clone.request_pause();
        assert_eq!(flags.poll(), ControlSignal::Pause);

        clone.request_cancel();
        // Cancel wins over pause
        assert_eq!(flags.poll(), ControlSignal::Cancel);

        flags.clear_pause();
        assert!(flags.is_cancelled());
    }

    #[test]
    fn test_child_flags_scope_cancellation() {
        let run = ControlFlags::new();
        let region = run.child();

        // Region cancel stays in the region
        region.request_cancel();
        assert!(region.is_cancelled());
        assert!(!run.is_cancelled());

        // Run-level cancel reaches into the region
        let region2 = run.child();
        run.request_cancel();
        assert!(region2.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let flags = ControlFlags::new();
        flags.request_cancel();
        flags.request_cancel();
        assert_eq!(flags.poll(), ControlSignal::Cancel);
    }

    #[tokio::test]
    async fn test_context_emits_with_ids_stamped() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(4);

        let mut variables = HashMap::new();
        variables.insert("x".to_string(), json!(1));
        let ctx = ExecutionContext::new("flow-7", bus).with_variables(variables);

        ctx.emit(ArchflowEvent::new(
            EventDomain::Tool,
            EventType::Progress,
            json!({"pct": 50}),
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.envelope.correlation_id.as_deref(), Some("flow-7"));
        assert_eq!(
            event.envelope.execution_id.as_deref(),
            Some(ctx.execution_id())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_check() {
        let ctx = ExecutionContext::new("f", EventBus::new())
            .with_deadline(Some(Instant::now() + std::time::Duration::from_secs(10)));

        assert!(ctx.check_deadline().is_ok());
        assert!(ctx.remaining().unwrap() > std::time::Duration::from_secs(9));

        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        assert!(matches!(
            ctx.check_deadline().unwrap_err(),
            FlowError::Timeout { .. }
        ));
        assert_eq!(ctx.remaining().unwrap(), std::time::Duration::ZERO);
    }

    #[test]
    fn test_guard_context_sees_variables_and_output() {
        let mut variables = HashMap::new();
        variables.insert("score".to_string(), json!(9));
        let ctx = ExecutionContext::new("f", EventBus::new())
            .with_variables(variables)
            .with_last_output(Some(json!({"ok": true})));

        let guard_ctx = ctx.guard_context();
        assert!(crate::guard::evaluate("score > 5 && output.ok", &guard_ctx).unwrap());
    }
}
