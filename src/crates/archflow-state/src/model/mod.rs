//! The persisted data model: run state, execution paths, step results,
//! metrics, and classified errors.

mod execution_error;
mod metrics;
mod path;
mod state;
mod status;
mod step;

pub use execution_error::{ExecutionError, ExecutionErrorType};
pub use metrics::{FlowMetrics, StepMetrics};
pub use path::{PathNode, PathTree};
pub use state::FlowState;
pub use status::{FlowStatus, PathStatus, StepStatus};
pub use step::StepResult;
