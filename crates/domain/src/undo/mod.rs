/// Window rules
pub mod policy;

/// Undo and correction
pub mod engine;

pub use engine::{
    AdherenceImpact, AdherenceSnapshot, CorrectionRequest, RetractionOutcome, UndoEngine,
    UndoHistoryEntry, UndoRequest,
};
pub use policy::{RetractionTarget, UndoPolicy, UndoValidation, UndoWindow};
