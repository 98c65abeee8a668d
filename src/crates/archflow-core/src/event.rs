//! Event streaming protocol
//!
//! Every observable moment in a run is an [`ArchflowEvent`]: a typed
//! envelope (domain, type, id, timestamp, optional correlation and execution
//! ids) plus a domain-specific payload. The [`EventBus`] fans events out to
//! subscribers in emission order.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "envelope": {
//!     "domain": "TOOL",
//!     "type": "TOOL_START",
//!     "id": "9f7c5c1e-...",
//!     "timestamp": "2025-03-14T09:26:53.589Z",
//!     "correlationId": "flow-42",
//!     "executionId": "run-9af1"
//!   },
//!   "data": { "toolName": "http_fetch", "input": {"url": "..."} }
//! }
//! ```
//!
//! Null fields are omitted. Within one `executionId`, subscribers observe
//! events in emission order.
//!
//! # Delivery
//!
//! Two subscription styles:
//!
//! - **Callbacks** ([`EventBus::subscribe_fn`]) run inline at the emit
//!   point; a panicking subscriber is caught and logged without affecting
//!   the others.
//! - **Channels** ([`EventBus::subscribe`]) hand back a bounded
//!   `mpsc::Receiver`; a full or dropped receiver loses events with a
//!   warning rather than blocking emission.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Which subsystem an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventDomain {
    Chat,
    Thinking,
    Tool,
    Interaction,
    Audit,
    System,
}

impl fmt::Display for EventDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Chat => "CHAT",
            Self::Thinking => "THINKING",
            Self::Tool => "TOOL",
            Self::Interaction => "INTERACTION",
            Self::Audit => "AUDIT",
            Self::System => "SYSTEM",
        };
        write!(f, "{}", s)
    }
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Start,
    End,
    Error,
    Delta,
    Message,
    Thinking,
    Reflection,
    Verification,
    ToolStart,
    Progress,
    Result,
    ToolError,
    Trace,
    Span,
    Metric,
    Log,
    Suspend,
    Form,
    Resume,
    Cancel,
    Connected,
    Disconnected,
    Heartbeat,
}

/// Metadata header of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Subsystem classification
    pub domain: EventDomain,

    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Unique event id
    pub id: Uuid,

    /// Emission instant
    pub timestamp: DateTime<Utc>,

    /// Ties events across components (usually the flow id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// The run or deterministic-executor execution this event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

/// Envelope plus payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchflowEvent {
    /// Metadata header
    pub envelope: EventEnvelope,

    /// Domain-specific payload
    pub data: Value,
}

impl ArchflowEvent {
    /// Event with a fresh id and the current timestamp
    pub fn new(domain: EventDomain, event_type: EventType, data: Value) -> Self {
        Self {
            envelope: EventEnvelope {
                domain,
                event_type,
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                correlation_id: None,
                execution_id: None,
            },
            data,
        }
    }

    /// Attach a correlation id
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.envelope.correlation_id = Some(id.into());
        self
    }

    /// Attach an execution id
    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.envelope.execution_id = Some(id.into());
        self
    }

    /// AUDIT/START at flow admission
    pub fn flow_started(flow_id: &str) -> Self {
        Self::new(
            EventDomain::Audit,
            EventType::Start,
            json!({ "flowId": flow_id }),
        )
        .with_correlation_id(flow_id)
    }

    /// AUDIT/END at terminal status
    pub fn flow_ended(flow_id: &str, status: &str) -> Self {
        Self::new(
            EventDomain::Audit,
            EventType::End,
            json!({ "flowId": flow_id, "status": status }),
        )
        .with_correlation_id(flow_id)
    }

    /// AUDIT/ERROR when a run fails
    pub fn flow_error(flow_id: &str, error: &archflow_state::ExecutionError) -> Self {
        Self::new(
            EventDomain::Audit,
            EventType::Error,
            json!({ "flowId": flow_id, "error": error }),
        )
        .with_correlation_id(flow_id)
    }

    /// TOOL/TOOL_START at a step boundary
    pub fn step_started(flow_id: &str, step_id: &str) -> Self {
        Self::new(
            EventDomain::Tool,
            EventType::ToolStart,
            json!({ "flowId": flow_id, "stepId": step_id }),
        )
        .with_correlation_id(flow_id)
    }

    /// TOOL/RESULT when a step completes
    pub fn step_result(flow_id: &str, step_id: &str, status: &str) -> Self {
        Self::new(
            EventDomain::Tool,
            EventType::Result,
            json!({ "flowId": flow_id, "stepId": step_id, "status": status }),
        )
        .with_correlation_id(flow_id)
    }

    /// TOOL/TOOL_ERROR when a step fails
    pub fn step_error(flow_id: &str, step_id: &str, message: &str) -> Self {
        Self::new(
            EventDomain::Tool,
            EventType::ToolError,
            json!({ "flowId": flow_id, "stepId": step_id, "message": message }),
        )
        .with_correlation_id(flow_id)
    }

    /// SYSTEM/HEARTBEAT for idle transports
    pub fn heartbeat() -> Self {
        Self::new(EventDomain::System, EventType::Heartbeat, Value::Null)
    }
}

type SubscriberFn = Box<dyn Fn(&ArchflowEvent) + Send + Sync>;

/// Fan-out hub for [`ArchflowEvent`]s
///
/// Cheap to clone; all clones share the subscriber lists. Emission is
/// synchronous and preserves order per subscriber.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    callbacks: RwLock<Vec<SubscriberFn>>,
    channels: RwLock<Vec<mpsc::Sender<ArchflowEvent>>>,
}

impl EventBus {
    /// Bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inline callback subscriber
    pub fn subscribe_fn<F>(&self, subscriber: F)
    where
        F: Fn(&ArchflowEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Box::new(subscriber));
    }

    /// Open a bounded channel subscription
    pub fn subscribe(&self, buffer: usize) -> mpsc::Receiver<ArchflowEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.inner.channels.write().push(tx);
        rx
    }

    /// Open a bounded subscription as a `Stream` (for SSE-style transports)
    pub fn subscribe_stream(
        &self,
        buffer: usize,
    ) -> tokio_stream::wrappers::ReceiverStream<ArchflowEvent> {
        tokio_stream::wrappers::ReceiverStream::new(self.subscribe(buffer))
    }

    /// Emit one event to every subscriber
    ///
    /// Callback panics are caught and logged; full or closed channels drop
    /// the event with a warning. Emission never raises to the caller.
    pub fn emit(&self, event: ArchflowEvent) {
        {
            let callbacks = self.inner.callbacks.read();
            for callback in callbacks.iter() {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&event);
                }));
                if result.is_err() {
                    tracing::error!(
                        domain = %event.envelope.domain,
                        "Event subscriber panicked; continuing with remaining subscribers"
                    );
                }
            }
        }

        let mut closed = false;
        {
            let channels = self.inner.channels.read();
            for tx in channels.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            domain = %event.envelope.domain,
                            "Event subscriber buffer full; dropping event for that subscriber"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
                }
            }
        }
        if closed {
            self.inner.channels.write().retain(|tx| !tx.is_closed());
        }
    }

    /// Number of live subscribers (callbacks + channels)
    pub fn subscriber_count(&self) -> usize {
        self.inner.callbacks.read().len() + self.inner.channels.read().len()
    }

    /// Emit SYSTEM/HEARTBEAT every `interval` until the handle is aborted
    pub fn spawn_heartbeat(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                bus.emit(ArchflowEvent::heartbeat());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_envelope_wire_format() {
        let event = ArchflowEvent::new(
            EventDomain::Tool,
            EventType::ToolStart,
            json!({"toolName": "calc"}),
        )
        .with_correlation_id("flow-1")
        .with_execution_id("exec-9");

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["envelope"]["domain"], json!("TOOL"));
        assert_eq!(wire["envelope"]["type"], json!("TOOL_START"));
        assert_eq!(wire["envelope"]["correlationId"], json!("flow-1"));
        assert_eq!(wire["envelope"]["executionId"], json!("exec-9"));
        assert_eq!(wire["data"]["toolName"], json!("calc"));
    }

    #[test]
    fn test_null_envelope_fields_omitted() {
        let event = ArchflowEvent::heartbeat();
        let wire = serde_json::to_value(&event).unwrap();
        let envelope = wire["envelope"].as_object().unwrap();
        assert!(!envelope.contains_key("correlationId"));
        assert!(!envelope.contains_key("executionId"));
    }

    #[test]
    fn test_callback_fan_out_preserves_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe_fn(move |event| {
            seen_clone
                .lock()
                .unwrap()
                .push(event.envelope.event_type);
        });

        bus.emit(ArchflowEvent::flow_started("f"));
        bus.emit(ArchflowEvent::step_started("f", "A"));
        bus.emit(ArchflowEvent::flow_ended("f", "COMPLETED"));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![EventType::Start, EventType::ToolStart, EventType::End]
        );
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe_fn(|_| panic!("bad subscriber"));
        let counter = delivered.clone();
        bus.subscribe_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(ArchflowEvent::heartbeat());
        bus.emit(ArchflowEvent::heartbeat());

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(8);

        bus.emit(ArchflowEvent::flow_started("f1"));
        bus.emit(ArchflowEvent::flow_ended("f1", "COMPLETED"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.envelope.event_type, EventType::Start);
        assert_eq!(second.envelope.event_type, EventType::End);
    }

    #[tokio::test]
    async fn test_stream_subscription() {
        use tokio_stream::StreamExt;

        let bus = EventBus::new();
        let mut stream = bus.subscribe_stream(4);
        bus.emit(ArchflowEvent::heartbeat());

        let event = stream.next().await.unwrap();
        assert_eq!(event.envelope.event_type, EventType::Heartbeat);
    }

    #[tokio::test]
    async fn test_closed_channel_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(1);
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);
        bus.emit(ArchflowEvent::heartbeat());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_task() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(8);
        let handle = bus.spawn_heartbeat(Duration::from_secs(5));

        // First tick fires immediately, then every 5s
        let event = rx.recv().await.unwrap();
        assert_eq!(event.envelope.event_type, EventType::Heartbeat);

        tokio::time::advance(Duration::from_secs(5)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.envelope.event_type, EventType::Heartbeat);

        handle.abort();
    }
}
