//! Medication Tracking Domain

/// Circuit breakers for outbound collaborators
pub mod circuit_breaker;

/// Time source and request identity
pub mod clock;

/// Runtime configuration
pub mod config;

/// Domain errors
pub mod errors;

/// Medication events
pub mod events;

/// Deterministic identifiers
pub mod ids;

/// Medication commands
pub mod medications;

/// Notification collaborator
pub mod notifications;

/// Error classification and recovery
pub mod recovery;

/// Orchestrator setup
pub mod setup;

/// Document storage
pub mod store;

/// Multi-document transactions
pub mod transactions;

/// Undo and correction
pub mod undo;

/// Business workflows
pub mod workflows;

pub use errors::{Error, Result};
