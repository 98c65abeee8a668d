//! Lifecycle status enums for flows, execution paths, and steps
//!
//! Three separate state machines live here:
//!
//! ```text
//! FlowStatus:   INITIALIZED -> RUNNING <-> PAUSED -> {COMPLETED | FAILED | STOPPED}
//! PathStatus:   STARTED -> RUNNING <-> PAUSED -> {COMPLETED | FAILED | MERGED}
//! StepStatus:   PENDING -> RUNNING -> {COMPLETED | FAILED | SKIPPED | CANCELLED | PAUSED | TIMEOUT}
//! ```
//!
//! Terminal statuses are reached exactly once; the store rejects transitions
//! out of a terminal status with [`StateError::InvalidTransition`](crate::StateError).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// State allocated, nothing dispatched yet
    Initialized,
    /// The execution manager is driving steps
    Running,
    /// Halted at a safe suspension point; resumable
    Paused,
    /// All branches finished without fatal errors
    Completed,
    /// A branch failed with no error path to divert to
    Failed,
    /// Cancelled by the client
    Stopped,
}

impl FlowStatus {
    /// Whether this status is terminal (no further transitions allowed)
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Whether a run in this status may still make progress (or be resumed)
    pub fn can_continue(&self) -> bool {
        !self.is_final()
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        match (self, next) {
            (Initialized, Running) | (Initialized, Stopped) | (Initialized, Failed) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Stopped) => {
                true
            }
            (Paused, Running) | (Paused, Stopped) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "INITIALIZED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{}", s)
    }
}

/// Status of a single execution path (branch) within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathStatus {
    /// Path created, no step finished yet
    Started,
    /// Path actively executing steps
    Running,
    /// Path halted with the rest of the run
    Paused,
    /// Path ran to its end without fatal errors
    Completed,
    /// Path hit a fatal error
    Failed,
    /// Parallel child folded into its parent at a join
    Merged,
}

impl PathStatus {
    /// Whether this path can make no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Merged)
    }
}

impl fmt::Display for PathStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "STARTED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Merged => "MERGED",
        };
        write!(f, "{}", s)
    }
}

/// Outcome status of a single step invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Queued, not dispatched
    Pending,
    /// Adapter currently executing
    Running,
    /// Step produced its output
    Completed,
    /// Step raised a fatal error
    Failed,
    /// Guard routed around this step
    Skipped,
    /// Cancellation observed before or during the step
    Cancelled,
    /// Pause observed before the step started
    Paused,
    /// Step-level deadline expired
    Timeout,
}

impl StepStatus {
    /// Whether the step reached an outcome
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    /// Whether the outcome counts as success for routing purposes
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
            Self::Timeout => "TIMEOUT",
        };
        write!(f, "{}", s)
    }
}
