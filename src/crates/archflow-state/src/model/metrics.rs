//! Flow and step metrics
//!
//! Metrics are append-only: counters only increase and timestamps are set
//! once. Aggregation of step metrics into flow metrics is monotonic, so a
//! reader never observes a completed-step count go backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wall-clock metrics for one step invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetrics {
    /// Step this metric belongs to
    pub step_id: String,

    /// When the adapter was invoked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the adapter returned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Total wall time, including retries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// How many attempts were made (1 when no retry happened)
    pub attempts: u32,
}

impl StepMetrics {
    /// Start the clock for a step
    pub fn started(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            start_time: Some(Utc::now()),
            end_time: None,
            duration_ms: None,
            attempts: 0,
        }
    }

    /// Record one attempt
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Stop the clock and derive the duration
    pub fn finish(&mut self) {
        let end = Utc::now();
        if let Some(start) = self.start_time {
            let millis = (end - start).num_milliseconds().max(0) as u64;
            self.duration_ms = Some(millis);
        }
        self.end_time = Some(end);
    }
}

/// Aggregated metrics for a whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetrics {
    /// When the run was admitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the run reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Number of steps in the flow plan
    pub total_steps: usize,

    /// Steps that reached a terminal status so far
    pub completed_steps: usize,

    /// Per-step metrics keyed by step id
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub step_metrics: HashMap<String, StepMetrics>,
}

impl FlowMetrics {
    /// Metrics for a run that is starting now
    pub fn started(total_steps: usize) -> Self {
        Self {
            start_time: Some(Utc::now()),
            end_time: None,
            total_steps,
            completed_steps: 0,
            step_metrics: HashMap::new(),
        }
    }

    /// Fold one step's metrics in; increments the completed-step counter
    ///
    /// Folding the same step id twice keeps the latest metric but counts the
    /// step only once, so the counter stays monotonic and bounded by
    /// `total_steps` for well-formed runs.
    pub fn aggregate(&mut self, metrics: StepMetrics) {
        let step_id = metrics.step_id.clone();
        if self.step_metrics.insert(step_id, metrics).is_none() {
            self.completed_steps += 1;
        }
    }

    /// Stamp the end of the run; idempotent
    pub fn finish(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    /// Total run duration, when both stamps are present
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}
