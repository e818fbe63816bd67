use thiserror::Error;

use crate::recovery::{ErrorClass, Severity};
use crate::store::StoreError;
use crate::transactions::RollbackReport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Entity not found: {entity} {id}")]
    NotFound { entity: String, id: String },

    #[error("Uniqueness conflict: {field}")]
    Uniqueness { field: String },

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Forbidden action")]
    Forbidden,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Undo rejected: {reason}")]
    UndoRejected {
        reason: String,
        requires_correction: bool,
        elapsed_seconds: i64,
    },

    #[error("Event {event_id} has already been undone or corrected")]
    AlreadyRetracted { event_id: String },

    #[error("Transaction {transaction_id} failed: {source}")]
    TransactionFailed {
        transaction_id: String,
        #[source]
        source: StoreError,
        rollback: Option<Box<RollbackReport>>,
    },

    #[error("Transaction {transaction_id} timed out after {timeout_ms}ms")]
    TransactionTimeout {
        transaction_id: String,
        timeout_ms: u64,
        rollback: Option<Box<RollbackReport>>,
    },

    #[error("Workflow phase {phase} failed: {source}")]
    PhaseFailed {
        phase: String,
        #[source]
        source: Box<Error>,
        compensated: Vec<String>,
    },

    #[error("Circuit breaker open for {name}")]
    CircuitOpen { name: String },

    #[error("Notification delivery failed: {message}")]
    Notification { message: String },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    /// Position of this error in the recovery taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound { .. }
            | Error::Uniqueness { .. }
            | Error::Validation { .. }
            | Error::UndoRejected { .. }
            | Error::AlreadyRetracted { .. }
            | Error::InvalidStateTransition { .. } => ErrorClass::Validation,
            Error::Unauthenticated => ErrorClass::Authentication,
            Error::Forbidden => ErrorClass::Authorization,
            Error::TransactionFailed { source, .. } | Error::Store(source) => match source {
                StoreError::AlreadyExists { .. } | StoreError::NotFound { .. } => {
                    ErrorClass::BusinessLogic
                }
                StoreError::Serialization(_) => ErrorClass::System,
                StoreError::VersionMismatch { .. }
                | StoreError::Conflict(_)
                | StoreError::Backend(_) => ErrorClass::Database,
            },
            Error::TransactionTimeout { .. } => ErrorClass::Database,
            Error::PhaseFailed { .. } => ErrorClass::BusinessLogic,
            Error::CircuitOpen { .. } | Error::Notification { .. } => ErrorClass::Network,
            Error::Serialization(_) | Error::Config { .. } => ErrorClass::System,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Error::TransactionFailed {
                source: StoreError::Backend(_),
                ..
            }
            | Error::Store(StoreError::Backend(_)) => Severity::High,
            Error::TransactionFailed { rollback: Some(report), .. }
            | Error::TransactionTimeout { rollback: Some(report), .. }
                if !report.is_clean() =>
            {
                Severity::High
            }
            _ => self.class().default_severity(),
        }
    }

    /// Retraction conflicts surface as store-level `AlreadyExists` on the
    /// deterministic retraction ID.
    pub(crate) fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::TransactionFailed {
                source: StoreError::AlreadyExists { .. },
                ..
            } | Error::Store(StoreError::AlreadyExists { .. })
        )
    }
}
