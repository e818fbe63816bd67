/// Event types and payloads
pub mod types;

/// Event repository
pub mod store;

pub use store::{ArchiveSummary, BatchFailure, BatchOutcome, CreateEventRequest, EventQuery, EventStore};
pub use types::{
    CorrectedAction, EventContext, EventData, EventMetadata, EventTiming, EventType,
    MedicationEvent, TriggerSource, UndoData,
};
