/// Command projection
pub mod command;

/// Input DTOs
pub mod inputs;

/// Command repository
pub mod repository;

pub use command::{
    CommandMetadata, Frequency, GracePeriod, MedicationClass, MedicationCommand, MedicationInfo,
    MedicationStatus, Schedule, StatusKind, ENTITY,
};
pub use inputs::{ChangeStatusInput, CommandPatch, CreateMedicationInput, MarkDoseTakenInput, SkipDoseInput};
pub use repository::{touches_schedule, CommandStore, PendingUpdate};
