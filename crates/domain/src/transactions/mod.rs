/// Coordinator and rollback
pub mod coordinator;

/// Transaction and rollback log records
pub mod log;

/// Specialized operation templates
pub mod templates;

/// Multi-phase transactions
pub mod distributed;

pub use coordinator::{TransactionCoordinator, TransactionReceipt, TransactionRequest};
pub use distributed::TransactionPhase;
pub use log::{
    ManualReviewItem, OperationRecord, RollbackReport, RollbackStatus, RollbackStrategy,
    TransactionLogEntry, TransactionStatus,
};
