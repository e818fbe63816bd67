use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::WriteOp;

/// What to do with a transaction's effects when it fails.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RollbackStrategy {
    /// Revert what can be reverted, queue the rest for review
    #[default]
    Automatic,
    /// Report only; an operator decides
    Manual,
    None,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// One requested write plus whether it brought a new document into being.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub op: WriteOp,
    pub creates_document: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransactionLogEntry {
    pub id: String,
    pub label: String,
    pub status: TransactionStatus,
    pub rollback_strategy: RollbackStrategy,
    pub operations: Vec<OperationRecord>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback_id: Option<String>,
}

impl TransactionLogEntry {
    pub(crate) fn finish(
        &mut self,
        status: TransactionStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Completed,
    /// Some operations could not be reverted and were queued for review
    PartiallyCompleted,
    Failed,
}

/// Outcome of reverting a failed transaction. Persisted to the rollback log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RollbackReport {
    pub id: String,
    pub transaction_id: String,
    pub status: RollbackStatus,
    /// `collection/id` of every document deleted by the rollback
    pub reverted: Vec<String>,
    /// Operations the failed commit never applied
    pub not_applied: Vec<String>,
    pub manual_review: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RollbackReport {
    /// Nothing left for an operator to look at.
    pub fn is_clean(&self) -> bool {
        self.status == RollbackStatus::Completed
    }
}

/// Work item for an operator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManualReviewItem {
    pub id: String,
    pub transaction_id: String,
    #[serde(default)]
    pub rollback_id: Option<String>,
    #[serde(default)]
    pub operation: Option<WriteOp>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}
