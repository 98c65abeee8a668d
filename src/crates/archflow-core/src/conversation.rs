//! Suspend/resume conversation manager
//!
//! A step that needs out-of-band user input suspends its conversation: the
//! manager parks a [`SuspendedConversation`] keyed by both the conversation
//! id and a fresh opaque resume token, emits INTERACTION/SUSPEND, and the
//! transport delivers the token to the client. Resuming with the token (and
//! the submitted form data) transitions the conversation to RESUMED and
//! emits INTERACTION/RESUME.
//!
//! # Tokens
//!
//! Resume tokens are bearer-capable: 32 bytes from the OS RNG, hex-encoded
//! (256 bits of entropy), carrying no identity. Expired or unknown tokens
//! answer "not found" rather than a specific error, so the API gives no
//! oracle for valid ids.
//!
//! # Lifecycle
//!
//! ```text
//! WAITING ──resume──► RESUMED ──complete──► (evicted)
//!    │
//!    ├──cancel──────► CANCELLED (evicted)
//!    └──expiry──────► TIMED_OUT (evicted by the sweep)
//! ```
//!
//! Tokens are single-use for state transitions: a second `resume` with the
//! same token returns `None`. Eviction removes the entry from both indexes.

use crate::error::{FlowError, Result};
use crate::event::{ArchflowEvent, EventBus, EventDomain, EventType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle status of a suspended conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    /// Parked, waiting for user input
    Waiting,
    /// User input received
    Resumed,
    /// Cancelled by the workflow or the client
    Cancelled,
    /// Expired before input arrived
    TimedOut,
}

/// One parked unit of user interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendedConversation {
    /// Externally-visible conversation id
    pub conversation_id: String,

    /// Opaque bearer token for resumption
    pub resume_token: String,

    /// Workflow that suspended
    pub workflow_id: String,

    /// Specific run, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_execution_id: Option<String>,

    /// Form schema presented to the user
    pub form: Value,

    /// When the conversation was parked
    pub created_at: DateTime<Utc>,

    /// Hard expiry; a resume after this answers "not found"
    pub expires_at: DateTime<Utc>,

    /// Lifecycle status
    pub status: ConversationStatus,

    /// Form data submitted on resume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_data: Option<Value>,

    /// Free-form context carried across the suspension
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, Value>,
}

/// Point-in-time counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    /// Conversations currently parked
    pub waiting: usize,
    /// Conversations resumed and not yet completed
    pub resumed: usize,
    /// Lifetime count of suspensions
    pub total_suspended: u64,
    /// Lifetime count of resumes
    pub total_resumed: u64,
    /// Lifetime count of cancellations
    pub total_cancelled: u64,
    /// Lifetime count of expiries
    pub total_timed_out: u64,
}

/// Parks and resumes conversations; process-wide, cheap to clone
#[derive(Clone)]
pub struct ConversationManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    by_id: DashMap<String, SuspendedConversation>,
    by_token: DashMap<String, String>,
    events: EventBus,
    total_suspended: AtomicU64,
    total_resumed: AtomicU64,
    total_cancelled: AtomicU64,
    total_timed_out: AtomicU64,
}

impl ConversationManager {
    /// Manager emitting on the given bus
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                by_id: DashMap::new(),
                by_token: DashMap::new(),
                events,
                total_suspended: AtomicU64::new(0),
                total_resumed: AtomicU64::new(0),
                total_cancelled: AtomicU64::new(0),
                total_timed_out: AtomicU64::new(0),
            }),
        }
    }

    /// Park a conversation and hand back its token
    pub fn suspend(
        &self,
        conversation_id: impl Into<String>,
        workflow_id: impl Into<String>,
        form: Value,
        timeout: Duration,
        context: Option<HashMap<String, Value>>,
    ) -> Result<SuspendedConversation> {
        let conversation_id = conversation_id.into();
        if self.inner.by_id.contains_key(&conversation_id) {
            return Err(FlowError::Conflict(format!(
                "conversation '{}' is already suspended",
                conversation_id
            )));
        }

        let now = Utc::now();
        let conversation = SuspendedConversation {
            conversation_id: conversation_id.clone(),
            resume_token: generate_token(),
            workflow_id: workflow_id.into(),
            workflow_execution_id: None,
            form,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            status: ConversationStatus::Waiting,
            form_data: None,
            context: context.unwrap_or_default(),
        };

        self.inner
            .by_token
            .insert(conversation.resume_token.clone(), conversation_id.clone());
        self.inner
            .by_id
            .insert(conversation_id.clone(), conversation.clone());
        self.inner.total_suspended.fetch_add(1, Ordering::Relaxed);

        self.inner.events.emit(
            ArchflowEvent::new(
                EventDomain::Interaction,
                EventType::Suspend,
                json!({
                    "conversationId": conversation.conversation_id,
                    "workflowId": conversation.workflow_id,
                    "resumeToken": conversation.resume_token,
                    "form": conversation.form,
                    "expiresAt": conversation.expires_at,
                }),
            )
            .with_correlation_id(conversation.workflow_id.clone()),
        );
        tracing::debug!(
            conversation_id = %conversation.conversation_id,
            workflow_id = %conversation.workflow_id,
            "Conversation suspended"
        );
        Ok(conversation)
    }

    /// Attach the specific run id to a suspended conversation
    pub fn bind_execution(&self, conversation_id: &str, execution_id: impl Into<String>) -> bool {
        match self.inner.by_id.get_mut(conversation_id) {
            Some(mut entry) => {
                entry.workflow_execution_id = Some(execution_id.into());
                true
            }
            None => false,
        }
    }

    /// Resume with a token and submitted form data
    ///
    /// Unknown, expired, or already-used tokens answer `None`. Expired
    /// entries are evicted on the way out.
    pub fn resume(&self, resume_token: &str, form_data: Value) -> Option<SuspendedConversation> {
        let conversation_id = self.inner.by_token.get(resume_token)?.clone();

        let expired = {
            let entry = self.inner.by_id.get(&conversation_id)?;
            entry.expires_at <= Utc::now()
        };
        if expired {
            self.evict(&conversation_id, ConversationStatus::TimedOut);
            return None;
        }

        let mut entry = self.inner.by_id.get_mut(&conversation_id)?;
        if entry.status != ConversationStatus::Waiting {
            return None;
        }
        entry.status = ConversationStatus::Resumed;
        entry.form_data = Some(form_data);
        let resumed = entry.clone();
        drop(entry);

        self.inner.total_resumed.fetch_add(1, Ordering::Relaxed);
        self.inner.events.emit(
            ArchflowEvent::new(
                EventDomain::Interaction,
                EventType::Resume,
                json!({
                    "conversationId": resumed.conversation_id,
                    "workflowId": resumed.workflow_id,
                    "formData": resumed.form_data,
                }),
            )
            .with_correlation_id(resumed.workflow_id.clone()),
        );
        tracing::debug!(
            conversation_id = %resumed.conversation_id,
            "Conversation resumed"
        );
        Some(resumed)
    }

    /// Cancel a waiting conversation; `false` when unknown or not waiting
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let waiting = self
            .inner
            .by_id
            .get(conversation_id)
            .map(|c| c.status == ConversationStatus::Waiting)
            .unwrap_or(false);
        if !waiting {
            return false;
        }

        if let Some(conversation) = self.evict(conversation_id, ConversationStatus::Cancelled) {
            self.inner.total_cancelled.fetch_add(1, Ordering::Relaxed);
            self.inner.events.emit(
                ArchflowEvent::new(
                    EventDomain::Interaction,
                    EventType::Cancel,
                    json!({
                        "conversationId": conversation.conversation_id,
                        "workflowId": conversation.workflow_id,
                    }),
                )
                .with_correlation_id(conversation.workflow_id),
            );
            true
        } else {
            false
        }
    }

    /// Drop a finished conversation from both indexes
    pub fn complete(&self, conversation_id: &str) -> bool {
        self.evict(conversation_id, ConversationStatus::Resumed)
            .is_some()
    }

    /// Sweep WAITING entries past expiry; returns how many were evicted
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .inner
            .by_id
            .iter()
            .filter(|entry| {
                entry.status == ConversationStatus::Waiting && entry.expires_at <= now
            })
            .map(|entry| entry.conversation_id.clone())
            .collect();

        let mut evicted = 0;
        for conversation_id in expired {
            if self
                .evict(&conversation_id, ConversationStatus::TimedOut)
                .is_some()
            {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(count = evicted, "Swept expired conversations");
        }
        evicted
    }

    /// Look up by conversation id (any status still indexed)
    pub fn get(&self, conversation_id: &str) -> Option<SuspendedConversation> {
        self.inner.by_id.get(conversation_id).map(|e| e.clone())
    }

    /// Snapshot counters
    pub fn stats(&self) -> ConversationStats {
        let mut waiting = 0;
        let mut resumed = 0;
        for entry in self.inner.by_id.iter() {
            match entry.status {
                ConversationStatus::Waiting => waiting += 1,
                ConversationStatus::Resumed => resumed += 1,
                _ => {}
            }
        }
        ConversationStats {
            waiting,
            resumed,
            total_suspended: self.inner.total_suspended.load(Ordering::Relaxed),
            total_resumed: self.inner.total_resumed.load(Ordering::Relaxed),
            total_cancelled: self.inner.total_cancelled.load(Ordering::Relaxed),
            total_timed_out: self.inner.total_timed_out.load(Ordering::Relaxed),
        }
    }

    /// Run [`ConversationManager::cleanup_expired`] every `interval` until
    /// the handle is aborted
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.cleanup_expired();
            }
        })
    }

    /// Remove from both indexes, stamping the final status
    fn evict(
        &self,
        conversation_id: &str,
        final_status: ConversationStatus,
    ) -> Option<SuspendedConversation> {
        let (_, mut conversation) = self.inner.by_id.remove(conversation_id)?;
        self.inner.by_token.remove(&conversation.resume_token);
        if final_status == ConversationStatus::TimedOut {
            self.inner.total_timed_out.fetch_add(1, Ordering::Relaxed);
        }
        conversation.status = final_status;
        Some(conversation)
    }
}

/// 32 bytes from the OS RNG, hex-encoded (256 bits of entropy)
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut token = String::with_capacity(64);
    for byte in bytes {
        let _ = write!(token, "{:02x}", byte);
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager() -> ConversationManager {
        ConversationManager::new(EventBus::new())
    }

    #[tokio::test]
    async fn test_suspend_emits_event_with_token() {
        let events = EventBus::new();
        let mut rx = events.subscribe(4);
        let manager = ConversationManager::new(events);

        let conversation = manager
            .suspend(
                "c1",
                "w1",
                json!({"fields": [{"name": "name"}]}),
                Duration::from_millis(500),
                None,
            )
            .unwrap();

        assert_eq!(conversation.status, ConversationStatus::Waiting);
        assert_eq!(conversation.resume_token.len(), 64);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.envelope.domain, EventDomain::Interaction);
        assert_eq!(event.envelope.event_type, EventType::Suspend);
        assert_eq!(
            event.data["resumeToken"],
            json!(conversation.resume_token)
        );
    }

    #[tokio::test]
    async fn test_resume_within_expiry() {
        let manager = manager();
        let conversation = manager
            .suspend("c1", "w1", json!({}), Duration::from_secs(60), None)
            .unwrap();

        assert!(manager.bind_execution("c1", "run-77"));
        let resumed = manager
            .resume(&conversation.resume_token, json!({"name": "J"}))
            .unwrap();
        assert_eq!(resumed.status, ConversationStatus::Resumed);
        assert_eq!(resumed.form_data, Some(json!({"name": "J"})));
        assert_eq!(resumed.workflow_execution_id.as_deref(), Some("run-77"));
    }

    #[tokio::test]
    async fn test_token_is_single_use_for_transitions() {
        let manager = manager();
        let conversation = manager
            .suspend("c1", "w1", json!({}), Duration::from_secs(60), None)
            .unwrap();

        assert!(manager
            .resume(&conversation.resume_token, json!({}))
            .is_some());
        assert!(manager
            .resume(&conversation.resume_token, json!({}))
            .is_none());
        // Still a lookup handle by conversation id
        assert_eq!(
            manager.get("c1").unwrap().status,
            ConversationStatus::Resumed
        );
    }

    #[tokio::test]
    async fn test_expired_resume_is_not_found_and_evicts() {
        let manager = manager();
        let conversation = manager
            .suspend("c1", "w1", json!({}), Duration::from_millis(0), None)
            .unwrap();

        assert!(manager
            .resume(&conversation.resume_token, json!({}))
            .is_none());
        // Both indexes dropped the entry
        assert!(manager.get("c1").is_none());
        assert!(manager
            .resume(&conversation.resume_token, json!({}))
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let manager = manager();
        assert!(manager.resume("no-such-token", json!({})).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_suspend_conflicts() {
        let manager = manager();
        manager
            .suspend("c1", "w1", json!({}), Duration::from_secs(60), None)
            .unwrap();
        assert!(matches!(
            manager
                .suspend("c1", "w1", json!({}), Duration::from_secs(60), None)
                .unwrap_err(),
            FlowError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_evicts_and_reports() {
        let events = EventBus::new();
        let mut rx = events.subscribe(8);
        let manager = ConversationManager::new(events);

        manager
            .suspend("c1", "w1", json!({}), Duration::from_secs(60), None)
            .unwrap();

        assert!(manager.cancel("c1"));
        assert!(manager.get("c1").is_none());
        assert!(!manager.cancel("c1"));

        // SUSPEND then CANCEL
        let _ = rx.recv().await.unwrap();
        let cancel = rx.recv().await.unwrap();
        assert_eq!(cancel.envelope.event_type, EventType::Cancel);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_only_expired_waiting() {
        let manager = manager();
        manager
            .suspend("old", "w1", json!({}), Duration::from_millis(0), None)
            .unwrap();
        manager
            .suspend("fresh", "w1", json!({}), Duration::from_secs(60), None)
            .unwrap();

        let swept = manager.cleanup_expired();
        assert_eq!(swept, 1);
        assert!(manager.get("old").is_none());
        assert!(manager.get("fresh").is_some());

        let stats = manager.stats();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.total_timed_out, 1);
    }

    #[tokio::test]
    async fn test_complete_drops_both_indexes() {
        let manager = manager();
        let conversation = manager
            .suspend("c1", "w1", json!({}), Duration::from_secs(60), None)
            .unwrap();
        manager.resume(&conversation.resume_token, json!({})).unwrap();

        assert!(manager.complete("c1"));
        assert!(manager.get("c1").is_none());
        assert!(manager.resume(&conversation.resume_token, json!({})).is_none());
    }

    #[test]
    fn test_tokens_are_unique_and_opaque() {
        let mut tokens = HashSet::new();
        for _ in 0..100 {
            let token = generate_token();
            assert_eq!(token.len(), 64);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(tokens.insert(token));
        }

        // No shared prefix structure between consecutive tokens
        let a = generate_token();
        let b = generate_token();
        let common_prefix = a
            .chars()
            .zip(b.chars())
            .take_while(|(x, y)| x == y)
            .count();
        assert!(common_prefix < 16);
    }

    #[tokio::test]
    async fn test_sweeper_task() {
        let manager = manager();
        manager
            .suspend("c1", "w1", json!({}), Duration::from_millis(0), None)
            .unwrap();

        let handle = manager.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.get("c1").is_none());
        assert_eq!(manager.stats().total_timed_out, 1);
        handle.abort();
    }
}
