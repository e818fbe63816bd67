/// Workflow orchestrator
pub mod orchestrator;

/// Result record
pub mod result;

/// Dose schedule generation
pub mod schedule;

pub use orchestrator::{MissedDoseSummary, WorkflowOrchestrator};
pub use result::{WorkflowResult, WorkflowRun};
pub use schedule::{is_scheduled_slot, upcoming_doses};
